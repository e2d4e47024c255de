use std::{collections::HashSet, path::PathBuf, sync::Arc};

use axum::http::{HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_YT_DLP_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_RATE_LIMIT_MAX: u32 = 100;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub yt_dlp_path: PathBuf,
    pub yt_dlp_timeout: Option<Duration>,
    pub rate_limit_max: u32,
    pub rate_limit_window: chrono::Duration,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
    pub workspace_root: PathBuf,
}

impl Config {
    pub fn from_env() -> Self {
        let yt_dlp_timeout = match read_parsed_env::<u64>("YT_DLP_TIMEOUT_SECONDS") {
            Some(0) => None,
            Some(seconds) => Some(Duration::from_secs(seconds)),
            None => Some(Duration::from_secs(DEFAULT_YT_DLP_TIMEOUT_SECONDS)),
        };
        let rate_limit_window = read_parsed_env::<u64>("RATE_LIMIT_WINDOW_SECONDS")
            .filter(|value| *value > 0)
            .map(window_from_seconds)
            .unwrap_or_else(default_rate_limit_window);

        Self {
            bind_addr: resolve_bind_addr(),
            yt_dlp_path: read_string_env("YT_DLP_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("yt-dlp")),
            yt_dlp_timeout,
            rate_limit_max: read_parsed_env::<u32>("RATE_LIMIT_MAX")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_RATE_LIMIT_MAX),
            rate_limit_window,
            trust_proxy_headers: read_bool_env("TRUST_PROXY_HEADERS").unwrap_or(false),
            allowed_origins: read_string_env("ALLOWED_ORIGINS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
            workspace_root: read_string_env("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
        }
    }

    /// Any origin when no allow-list is configured.
    pub fn cors_layer(&self) -> Result<CorsLayer, String> {
        let layer = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers([CONTENT_DISPOSITION]);

        if self.allowed_origins.is_empty() {
            info!("ALLOWED_ORIGINS not set, accepting requests from any origin");
            return Ok(layer.allow_origin(Any));
        }

        let normalized_origins = self
            .allowed_origins
            .iter()
            .map(|origin| {
                normalize_origin(origin).ok_or_else(|| {
                    format!(
                        "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                    )
                })
            })
            .collect::<Result<HashSet<_>, _>>()?;
        info!(
            "CORS allow-list loaded with {} origin(s): {:?}",
            normalized_origins.len(),
            normalized_origins
        );

        let allowed_origins = Arc::new(normalized_origins);
        Ok(layer.allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _| {
                let normalized = origin.to_str().ok().and_then(normalize_origin);
                let allowed = normalized
                    .as_ref()
                    .is_some_and(|value| allowed_origins.contains(value));
                debug!(
                    "CORS origin check raw={:?} normalized={:?} allowed={}",
                    origin, normalized, allowed
                );
                allowed
            },
        )))
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_bool_env(name: &str) -> Option<bool> {
    let value = read_string_env(name)?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            warn!("Ignoring invalid boolean in {name}: {value:?}");
            None
        }
    }
}

fn read_parsed_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = read_string_env(name)?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid value in {name}: {value:?}");
            None
        }
    }
}

fn default_rate_limit_window() -> chrono::Duration {
    chrono::Duration::seconds(DEFAULT_RATE_LIMIT_WINDOW_SECONDS)
}

fn window_from_seconds(seconds: u64) -> chrono::Duration {
    match i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
    {
        Some(window) => window,
        None => {
            warn!(
                "RATE_LIMIT_WINDOW_SECONDS={seconds} is out of range, using {DEFAULT_RATE_LIMIT_WINDOW_SECONDS}"
            );
            default_rate_limit_window()
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    let port = read_parsed_env::<u16>("PORT").unwrap_or(DEFAULT_PORT);
    format!("0.0.0.0:{port}")
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
