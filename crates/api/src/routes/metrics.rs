use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// GET /metrics -- Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> AppResult<Response> {
    let body = state
        .metrics
        .render()
        .map_err(|e| AppError::InternalError(format!("Failed to encode metrics: {e}")))?;

    Ok(([(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body).into_response())
}

pub fn router() -> Router<AppState> {
    Router::new().route("/metrics", get(metrics_handler))
}
