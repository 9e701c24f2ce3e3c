//! Handler for `POST /events`.
//!
//! The body is decoded by hand rather than through the `Json` extractor so a
//! producer that omits `Content-Type` is still accepted and every decode
//! failure comes back as the usual `{error, code}` body.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use onboard_core::trigger::InboundEvent;
use onboard_saga::intake::{accept_event, Intake};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub status: &'static str,
}

/// POST /events
///
/// `202` when a saga was dispatched, `204` for event types the coordinator
/// does not handle, `400` for malformed input.
pub async fn ingest(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    let event: InboundEvent = serde_json::from_slice(&body).map_err(|e| {
        state.metrics.record_event("http", "malformed");
        AppError::BadRequest(format!("Invalid event body: {e}"))
    })?;

    match accept_event(&state.dispatcher, "http", &event) {
        Intake::Dispatched => Ok((
            StatusCode::ACCEPTED,
            Json(Accepted { status: "accepted" }),
        )
            .into_response()),
        Intake::Ignored => Ok(StatusCode::NO_CONTENT.into_response()),
        Intake::Rejected(err) => Err(AppError::Core(err)),
        Intake::Unavailable => Err(AppError::ServiceUnavailable(
            "Coordinator is shutting down".into(),
        )),
    }
}
