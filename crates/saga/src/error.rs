use onboard_core::error::CoreError;
use onboard_core::types::SagaId;

/// Error type for saga store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Saga {0} not found")]
    NotFound(SagaId),

    /// The saga changed since it was read; another owner is driving it.
    #[error("Saga {id} was modified concurrently (expected version {expected})")]
    Conflict { id: SagaId, expected: i64 },

    #[error(transparent)]
    Rule(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying the same write could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(sqlx::Error::RowNotFound) => false,
            StoreError::Database(_) | StoreError::Unavailable(_) => true,
            _ => false,
        }
    }
}

/// Why a coordinator run stopped before reaching a terminal state.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// A state write failed after its retries; nothing was published.
    #[error("Saga store error: {0}")]
    Store(StoreError),

    /// Another owner advanced the saga first.
    #[error("Saga {0} was superseded by a concurrent owner")]
    Superseded(SagaId),

    #[error("Saga {0} not found")]
    NotFound(SagaId),

    /// Shutdown interrupted the run; the saga is left for the sweeper.
    #[error("Saga {0} interrupted by shutdown")]
    Cancelled(SagaId),
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { id, .. } => CoordinatorError::Superseded(id),
            StoreError::NotFound(id) => CoordinatorError::NotFound(id),
            other => CoordinatorError::Store(other),
        }
    }
}
