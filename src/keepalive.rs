//! Keep-alive HTTP endpoint
//!
//! Hosting platforms that idle out silent processes poll `GET /`; `GET /health`
//! adds a JSON view of the relay for monitoring.

use crate::config::KeepAliveConfig;
use crate::error::{Error, Result};
use crate::operation::OperationTracker;
use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
struct KeepAliveState {
    tracker: OperationTracker,
}

/// Body of `GET /health`
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    operation: Option<crate::types::OperationSnapshot>,
}

/// Router serving `GET /` and `GET /health`
pub fn create_router(tracker: OperationTracker) -> Router {
    Router::new()
        .route("/", get(alive))
        .route("/health", get(health_check))
        .with_state(KeepAliveState { tracker })
        .layer(TraceLayer::new_for_http())
}

async fn alive() -> &'static str {
    "I'm alive!"
}

async fn health_check(State(state): State<KeepAliveState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        operation: state.tracker.current(),
    })
}

/// Serve the keep-alive endpoint until `shutdown` fires
pub async fn serve(
    config: &KeepAliveConfig,
    tracker: OperationTracker,
    shutdown: CancellationToken,
) -> Result<()> {
    let bind_address = config.bind_address;
    let listener = TcpListener::bind(bind_address).await.map_err(Error::Io)?;
    tracing::info!(address = %bind_address, "keep-alive server listening");

    axum::serve(listener, create_router(tracker))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Server(e.to_string()))?;

    tracing::info!("keep-alive server stopped");
    Ok(())
}
