//! Prometheus /metrics endpoint

use crate::state::HasServices;
use axum::{extract::State, http::StatusCode, response::IntoResponse};

/// GET /metrics: Prometheus text exposition format.
pub async fn metrics_handler<S: HasServices>(State(state): State<S>) -> impl IntoResponse {
    match state.metrics_handle() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "Metrics not enabled".to_string()),
    }
}
