use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::extractor::ExtractError;

pub const PRIVATE_VIDEO_MESSAGE: &str =
    "This video appears to require login or is private. Only public videos can be accessed.";
pub const PRIVATE_MEDIA_MESSAGE: &str =
    "This media appears to require login or is private. Only public content can be downloaded.";

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub retry_after_seconds: Option<u64>,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    pub fn too_many_requests(retry_after_seconds: u64) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "Too many requests, please try again later.".to_string(),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }

    /// Server error whose message hides access-restriction details behind
    /// `restricted_message`.
    pub fn extraction(raw: impl ToString, restricted_message: &str) -> Self {
        Self::internal(classify_failure_message(&raw.to_string(), restricted_message))
    }

    /// Like [`ApiError::extraction`], but the restriction check covers all of
    /// yt-dlp's stderr while only the final line is passed through.
    pub fn from_extract(error: &ExtractError, restricted_message: &str) -> Self {
        Self::classified(error.to_string(), &error.diagnostics(), restricted_message)
    }

    fn classified(message: String, detail: &str, restricted_message: &str) -> Self {
        if is_access_restricted(detail) {
            Self::internal(restricted_message)
        } else {
            Self::internal(message)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });

        let mut response = (self.status, body).into_response();
        if let Some(seconds) = self.retry_after_seconds
            && let Ok(value) = HeaderValue::from_str(&seconds.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }

        response
    }
}

/// Replaces messages that look like a login wall or a private item with
/// `restricted_message`; everything else passes through untouched.
pub fn classify_failure_message(raw: &str, restricted_message: &str) -> String {
    if is_access_restricted(raw) {
        restricted_message.to_string()
    } else {
        raw.to_string()
    }
}

fn is_access_restricted(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["403", "login", "private"]
        .iter()
        .any(|marker| lower.contains(marker))
}
