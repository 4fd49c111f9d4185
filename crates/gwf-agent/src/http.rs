// Observability HTTP surface
//
// GET /metrics  - Prometheus text exposition (v0.0.4)
// GET /healthz  - liveness check
// GET /statsz   - pipeline health snapshot as JSON

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use gwf_core::{HealthSnapshot, MetricsCollector};
use gwf_queue::PersistedQueue;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<MetricsCollector>,
    pub store: Option<Arc<PersistedQueue>>,
}

/// Serve until the root context is canceled, logging instead of bubbling
/// errors: a broken observability listener must not take the pipeline down.
pub async fn serve_logged(addr: String, state: AppState, cancel: CancellationToken) {
    if let Err(err) = serve(addr, state, cancel).await {
        error!(error = %err, "observability server failed");
    }
}

async fn serve(addr: String, state: AppState, cancel: CancellationToken) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_text))
        .route("/healthz", get(health_check))
        .route("/statsz", get(stats))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    info!("observability endpoint listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("observability server error")?;

    Ok(())
}

async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render_prometheus(),
    )
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let persist = state.store.as_ref().map(|s| s.health());
    Json(HealthSnapshot::collect(&state.metrics, persist))
}
