//! Saga and transition rows.

use onboard_core::error::CoreError;
use onboard_core::saga::{Saga, SagaState, SagaTransition, StateId};
use onboard_core::types::{SagaId, Timestamp};
use sqlx::FromRow;

/// A row from the `sagas` table.
#[derive(Debug, Clone, FromRow)]
pub struct SagaRow {
    pub id: SagaId,
    pub subject_id: String,
    pub state_id: StateId,
    pub payload: serde_json::Value,
    pub version: i64,
    pub last_error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<SagaRow> for Saga {
    type Error = CoreError;

    fn try_from(row: SagaRow) -> Result<Self, Self::Error> {
        let state = decode_state(row.state_id)?;
        Ok(Saga {
            id: row.id,
            subject_id: row.subject_id,
            state,
            payload: row.payload,
            version: row.version,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// A row from the `saga_transitions` table.
#[derive(Debug, Clone, FromRow)]
pub struct SagaTransitionRow {
    pub saga_id: SagaId,
    pub from_state_id: Option<StateId>,
    pub to_state_id: StateId,
    pub detail: Option<String>,
    pub created_at: Timestamp,
}

impl TryFrom<SagaTransitionRow> for SagaTransition {
    type Error = CoreError;

    fn try_from(row: SagaTransitionRow) -> Result<Self, Self::Error> {
        Ok(SagaTransition {
            saga_id: row.saga_id,
            from_state: row.from_state_id.map(decode_state).transpose()?,
            to_state: decode_state(row.to_state_id)?,
            detail: row.detail,
            created_at: row.created_at,
        })
    }
}

fn decode_state(id: StateId) -> Result<SagaState, CoreError> {
    SagaState::from_id(id).ok_or_else(|| CoreError::Internal(format!("Unknown saga state id {id}")))
}
