use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SweepStarted {
    pub status: &'static str,
}

/// POST /reconcile
///
/// Starts a sweep in the background and returns without waiting for it.
pub async fn start_sweep(State(state): State<AppState>) -> AppResult<(StatusCode, Json<SweepStarted>)> {
    if !state.sweeper.trigger() {
        return Err(AppError::ServiceUnavailable(
            "Coordinator is shutting down".into(),
        ));
    }
    tracing::info!("Reconciliation sweep requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(SweepStarted {
            status: "sweep_started",
        }),
    ))
}
