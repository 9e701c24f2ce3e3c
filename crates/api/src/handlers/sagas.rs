//! Read-only saga endpoints.

use axum::extract::{Path, Query, State};
use axum::Json;
use onboard_core::error::CoreError;
use onboard_core::saga::{Saga, SagaState, SagaTransition};
use onboard_core::types::{SagaId, Timestamp};
use onboard_db::repositories::SagaListQuery;
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

/// One row of `GET /sagas`.
#[derive(Debug, Serialize)]
pub struct SagaSummary {
    pub id: SagaId,
    pub user_id: String,
    pub state: SagaState,
    pub updated_at: Timestamp,
}

impl From<Saga> for SagaSummary {
    fn from(saga: Saga) -> Self {
        Self {
            id: saga.id,
            user_id: saga.subject_id,
            state: saga.state,
            updated_at: saga.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransitionView {
    pub from: Option<SagaState>,
    pub to: SagaState,
    pub detail: Option<String>,
    pub at: Timestamp,
}

impl From<SagaTransition> for TransitionView {
    fn from(t: SagaTransition) -> Self {
        Self {
            from: t.from_state,
            to: t.to_state,
            detail: t.detail,
            at: t.created_at,
        }
    }
}

/// Body of `GET /sagas/{id}`.
#[derive(Debug, Serialize)]
pub struct SagaDetail {
    pub id: SagaId,
    pub user_id: String,
    pub state: SagaState,
    pub version: i64,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub transitions: Vec<TransitionView>,
}

/// GET /sagas?state=&limit=&offset=
pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<SagaListQuery>,
) -> AppResult<Json<Vec<SagaSummary>>> {
    let filter = params
        .state
        .as_deref()
        .map(str::parse::<SagaState>)
        .transpose()?;

    let sagas = state.store.list(filter, params.limit, params.offset).await?;
    Ok(Json(sagas.into_iter().map(SagaSummary::from).collect()))
}

/// GET /sagas/{id}
///
/// Terminal sagas are served from the cache; anything still in flight is
/// read from the store.
pub async fn get_by_id(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> AppResult<Json<SagaDetail>> {
    let id: SagaId = raw_id
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Invalid saga id '{raw_id}'")))?;

    let saga = state
        .cache
        .get_or_load(state.store.as_ref(), id)
        .await?
        .ok_or(CoreError::NotFound { entity: "Saga", id })?;
    let transitions = state.store.transitions(id).await?;

    Ok(Json(SagaDetail {
        id: saga.id,
        user_id: saga.subject_id,
        state: saga.state,
        version: saga.version,
        last_error: saga.last_error,
        payload: saga.payload,
        created_at: saga.created_at,
        updated_at: saga.updated_at,
        transitions: transitions.into_iter().map(TransitionView::from).collect(),
    }))
}
