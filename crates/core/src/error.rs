use crate::saga::SagaState;
use crate::types::SagaId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: SagaId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Illegal saga transition: {from} -> {to}")]
    IllegalTransition { from: SagaState, to: SagaState },

    #[error("Internal error: {0}")]
    Internal(String),
}
