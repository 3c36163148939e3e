//! Read-side endpoints: `/metrics`, `/api/metrics` and the `/health` checks.

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::http::server::AppState;
use crate::observability::metrics;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Metric name prefix derived from the service name.
///
/// Prometheus names match `[a-zA-Z_:][a-zA-Z0-9_:]*`, so a leading digit gets
/// an underscore in front.
pub fn metric_prefix(service_name: &str) -> String {
    let prefix: String = service_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if prefix.starts_with(|c: char| c.is_ascii_digit()) {
        format!("_{prefix}")
    } else {
        prefix
    }
}

/// Prometheus text exposition: per-server request series followed by the
/// process-wide pipeline counters.
pub async fn prometheus(State(state): State<AppState>) -> Response {
    let mut body = state.aggregator.render_prometheus();
    body.push_str(&metrics::render());

    (StatusCode::OK, [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response()
}

/// JSON snapshot with derived averages and percentiles.
pub async fn snapshot(State(state): State<AppState>) -> Response {
    let snapshot = state.aggregator.snapshot();
    Json(json!({
        "service": state.config.service.name,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "metrics": snapshot,
    }))
    .into_response()
}

pub async fn health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "healthy",
        "service": state.config.service.name,
        "version": state.config.service.version,
        "environment": state.config.service.environment,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

/// Readiness: 503 until the server is serving, and again once it drains.
pub async fn readiness(State(state): State<AppState>) -> Response {
    if state.is_ready() {
        Json(json!({ "status": "ready", "service": state.config.service.name })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not ready", "reason": "not accepting traffic" })),
        )
            .into_response()
    }
}

/// Liveness: the process answers requests.
pub async fn liveness() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}
