pub mod health;
pub mod metrics;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the saga route tree.
///
/// ```text
/// /events              ingest a platform event (POST)
/// /sagas               list sagas (GET)
/// /sagas/{id}          saga detail with transition history (GET)
/// /reconcile           start a sweep for stalled sagas (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/events", post(handlers::events::ingest))
        .route("/sagas", get(handlers::sagas::list))
        .route("/sagas/{id}", get(handlers::sagas::get_by_id))
        .route("/reconcile", post(handlers::reconcile::start_sweep))
}
