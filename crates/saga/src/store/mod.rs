//! The durable saga store.
//!
//! [`SagaStore`] is the seam between the coordinator and persistence. State
//! changes are compare-and-set on the saga's `version`; a writer holding a
//! stale copy gets [`StoreError::Conflict`] and must stop driving the saga.

mod memory;
mod postgres;

pub use memory::InMemorySagaStore;
pub use postgres::PgSagaStore;

use async_trait::async_trait;
use onboard_core::saga::{NewSaga, Saga, SagaState, SagaTransition};
use onboard_core::types::{SagaId, Timestamp};

use crate::error::StoreError;

#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Cheap liveness probe for health checks.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Create a saga in `Started`, or return the one already recorded for
    /// the same subject. The boolean is `true` when a saga was created.
    async fn insert_or_get(&self, new: &NewSaga) -> Result<(Saga, bool), StoreError>;

    async fn get(&self, id: SagaId) -> Result<Option<Saga>, StoreError>;

    /// Newest first, optionally filtered by state.
    async fn list(
        &self,
        state: Option<SagaState>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Saga>, StoreError>;

    /// Non-terminal sagas last written before `cutoff`, oldest first.
    async fn list_stalled(&self, cutoff: Timestamp, limit: i64) -> Result<Vec<Saga>, StoreError>;

    /// Move `current` to `to`.
    ///
    /// Fails with [`StoreError::Rule`] for an illegal step and
    /// [`StoreError::Conflict`] when the stored version moved on.
    async fn transition(
        &self,
        current: &Saga,
        to: SagaState,
        detail: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Saga, StoreError>;

    /// Take ownership of `current` without changing its state.
    async fn claim(&self, current: &Saga) -> Result<Saga, StoreError>;

    /// Audit trail, oldest first.
    async fn transitions(&self, id: SagaId) -> Result<Vec<SagaTransition>, StoreError>;
}
