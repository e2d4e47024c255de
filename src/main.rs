mod config;
mod error;
mod extractor;
mod handlers;
mod rate_limit;
mod workspace;

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{
    config::Config,
    extractor::YtDlp,
    handlers::{AppState, build_router},
    rate_limit::{RateLimiter, SystemClock},
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "ytdlp_gateway=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(message) = run().await {
        error!("Server error: {message}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = Config::from_env();

    let extractor = YtDlp::new(config.yt_dlp_path.clone(), config.yt_dlp_timeout);
    extractor.log_availability().await;

    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_max,
        config.rate_limit_window,
        config.trust_proxy_headers,
        Arc::new(SystemClock),
    ));
    let pruner = limiter.spawn_pruner();

    let state = AppState {
        extractor: Arc::new(extractor),
        workspace_root: config.workspace_root.clone(),
    };
    info!("Workspaces will be created under {:?}", state.workspace_root);

    let app = build_router(state, limiter)
        .layer(config.cors_layer()?)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| format!("Could not bind {}: {error}", config.bind_addr))?;

    info!("Server running on {}", config.bind_addr);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|error| format!("HTTP server error: {error}"));

    pruner.abort();
    info!("Server stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!("Could not listen for Ctrl-C: {error}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!("Could not listen for SIGTERM: {error}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
