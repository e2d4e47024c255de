use std::{
    io,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    Form, Json, Router,
    body::{Body, Bytes},
    extract::{
        Query, State,
        rejection::{FormRejection, QueryRejection},
    },
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::fs::File;
use tokio_stream::Stream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::{
    error::{ApiError, PRIVATE_MEDIA_MESSAGE, PRIVATE_VIDEO_MESSAGE},
    extractor::{MaterializeOptions, MediaDescriptor, MediaExtractor, MediaType},
    rate_limit::{self, RateLimiter},
    workspace::Workspace,
};

#[derive(Clone)]
pub struct AppState {
    pub extractor: Arc<dyn MediaExtractor>,
    pub workspace_root: PathBuf,
}

pub fn build_router(state: AppState, limiter: Arc<RateLimiter>) -> Router {
    Router::new()
        .route("/info", get(fetch_info))
        .route("/download", post(download))
        .with_state(state)
        .layer(middleware::from_fn_with_state(limiter, rate_limit::enforce))
}

#[derive(Debug, Default, Deserialize)]
struct InfoQuery {
    url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DownloadForm {
    url: Option<String>,
    format_id: Option<String>,
    #[serde(rename = "type")]
    media_type: Option<String>,
}

async fn fetch_info(
    State(state): State<AppState>,
    query: Result<Query<InfoQuery>, QueryRejection>,
) -> Result<Json<MediaDescriptor>, ApiError> {
    let query = query
        .map(|Query(query)| query)
        .unwrap_or_else(|rejection| {
            debug!("Unreadable /info query: {rejection}");
            InfoQuery::default()
        });
    let Some(url) = query.url.filter(|value| !value.is_empty()) else {
        return Err(ApiError::bad_request("No URL provided"));
    };

    let info = state.extractor.describe(&url).await.map_err(|error| {
        warn!(
            "Metadata extraction failed for {:?}: {}",
            url,
            error.diagnostics()
        );
        ApiError::from_extract(&error, PRIVATE_VIDEO_MESSAGE)
    })?;

    Ok(Json(MediaDescriptor::from(info)))
}

async fn download(
    State(state): State<AppState>,
    form: Result<Form<DownloadForm>, FormRejection>,
) -> Result<Response, ApiError> {
    let form = form.map(|Form(form)| form).unwrap_or_default();
    let (Some(url), Some(format_id)) = (
        form.url.filter(|value| !value.is_empty()),
        form.format_id.filter(|value| !value.is_empty()),
    ) else {
        return Err(ApiError::bad_request("Missing url or format_id"));
    };
    let media_type = MediaType::from_form(form.media_type.as_deref());

    let workspace = Workspace::acquire(&state.workspace_root)
        .map_err(|error| ApiError::extraction(error, PRIVATE_MEDIA_MESSAGE))?;

    let located = async {
        let options = MaterializeOptions {
            format_id,
            output_template: workspace.output_template(),
            media_type,
        };
        state
            .extractor
            .materialize(&url, &options)
            .await
            .map_err(|error| {
                warn!("Download failed for {:?}: {}", url, error.diagnostics());
                ApiError::from_extract(&error, PRIVATE_MEDIA_MESSAGE)
            })?;

        let files = workspace.files().await.map_err(|error| {
            ApiError::extraction(
                format!("Could not read download directory: {error}"),
                PRIVATE_MEDIA_MESSAGE,
            )
        })?;
        if files.len() > 1 {
            warn!(
                "Extractor produced {} files for {:?}; serving the first",
                files.len(),
                url
            );
        }
        files
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::internal("No file was downloaded"))
    }
    .await;

    let file_path = match located {
        Ok(path) => path,
        Err(error) => {
            warn!("Download of {:?} not served: {}", url, error.message);
            workspace.release_async().await;
            return Err(error);
        }
    };

    respond_with_file(workspace, &file_path).await
}

/// Builds the attachment response for `file_path`. The workspace travels
/// with the body and is released once the body is done with it; if the
/// file cannot be opened it is released before the error is returned.
async fn respond_with_file(
    workspace: Workspace,
    file_path: &Path,
) -> Result<Response, ApiError> {
    let prepared = match open_attachment(file_path).await {
        Ok(prepared) => prepared,
        Err(error) => {
            warn!("Could not open downloaded file {:?}: {error}", file_path);
            workspace.release_async().await;
            return Err(ApiError::internal("Failed to send file"));
        }
    };

    let Ok(disposition) = HeaderValue::from_str(&build_content_disposition(&prepared.filename))
    else {
        drop(prepared);
        workspace.release_async().await;
        return Err(ApiError::internal("Failed to send file"));
    };

    info!(
        "Streaming {:?} ({} bytes)",
        prepared.filename, prepared.content_length
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for_filename(&prepared.filename)),
    );
    headers.insert(CONTENT_LENGTH, HeaderValue::from(prepared.content_length));
    headers.insert(CONTENT_DISPOSITION, disposition);

    let body = Body::from_stream(WorkspaceStream::new(
        ReaderStream::new(prepared.file),
        workspace,
    ));

    Ok((StatusCode::OK, headers, body).into_response())
}

struct PreparedAttachment {
    file: File,
    filename: String,
    content_length: u64,
}

async fn open_attachment(path: &Path) -> io::Result<PreparedAttachment> {
    let file = File::open(path).await?;
    let metadata = file.metadata().await?;
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .map(ToString::to_string)
        .unwrap_or_else(|| "download.bin".to_string());

    Ok(PreparedAttachment {
        file,
        filename,
        content_length: metadata.len(),
    })
}

/// Body stream that owns the workspace it is read from. The workspace is
/// released when the stream ends, fails, or is dropped by a disconnecting
/// client. Removal is handed to the blocking pool so the poll never touches
/// the filesystem itself.
struct WorkspaceStream<S> {
    inner: Option<S>,
    workspace: Option<Workspace>,
}

impl<S> WorkspaceStream<S> {
    fn new(inner: S, workspace: Workspace) -> Self {
        Self {
            inner: Some(inner),
            workspace: Some(workspace),
        }
    }

    fn finish(&mut self) {
        // Close the file before its directory goes away.
        self.inner = None;
        if let Some(workspace) = self.workspace.take() {
            workspace.release_in_background();
        }
    }
}

impl<S> Stream for WorkspaceStream<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };

        let poll = Pin::new(inner).poll_next(cx);
        match &poll {
            Poll::Ready(None) => self.finish(),
            Poll::Ready(Some(Err(error))) => {
                warn!("File transfer failed: {error}");
                self.finish();
            }
            _ => {}
        }
        poll
    }
}

impl<S> Drop for WorkspaceStream<S> {
    fn drop(&mut self) {
        self.finish();
    }
}


fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "3gp" => "video/3gpp",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    if safe_ascii == filename {
        format!("attachment; filename=\"{safe_ascii}\"")
    } else {
        format!(
            "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
            urlencoding::encode(filename)
        )
    }
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if (character.is_ascii_graphic() && !matches!(character, '"' | '\\'))
                || character == ' '
            {
                character
            } else {
                '?'
            }
        })
        .collect();

    let compact = sanitized.trim();
    if compact.is_empty() {
        "download.bin".to_string()
    } else {
        compact.to_string()
    }
}
