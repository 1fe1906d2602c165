//! Status and ingest HTTP API.
//!
//! - `GET /health`: liveness
//! - `GET /api/status`: `PipelineStatus` snapshot
//! - `POST /api/ingest`: push an `IngestBatch`, returns the `IngestReport`
//! - `GET /metrics`: Prometheus exposition

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, warn};

use crate::ingest::IngestBatch;
use crate::pipeline::Pipeline;

#[derive(Clone)]
struct AppState {
    pipeline: Arc<Pipeline>,
    metrics: PrometheusHandle,
}

/// Build the API router. `metrics` renders whatever recorder the caller
/// installed (see `telemetry::install_recorder`).
pub fn routes(pipeline: Arc<Pipeline>, metrics: PrometheusHandle) -> Router {
    let state = AppState { pipeline, metrics };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/api/status", get(status))
        .route("/api/ingest", post(ingest))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "deal-relay"
    }))
}

// ── Metrics ─────────────────────────────────────────────────────────────

/// Queue and health gauges are refreshed from the store on every scrape.
async fn metrics_text(State(state): State<AppState>) -> String {
    if let Err(e) = state.pipeline.status().await {
        warn!(error = %e, "Scrape served stale queue and health gauges");
    }
    state.metrics.render()
}

// ── Status ──────────────────────────────────────────────────────────────

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    match state.pipeline.status().await {
        Ok(status) => (StatusCode::OK, Json(serde_json::json!(status))),
        Err(e) => {
            error!(error = %e, "Failed to build status");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({"error": e.to_string()})),
            )
        }
    }
}

// ── Ingest ──────────────────────────────────────────────────────────────

async fn ingest(
    State(state): State<AppState>,
    Json(mut batch): Json<IngestBatch>,
) -> impl IntoResponse {
    if batch.source.is_empty() {
        batch.source = "api".into();
    }
    let report = state.pipeline.ingest(batch).await;
    let code = if report.halted.is_some() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report))
}
