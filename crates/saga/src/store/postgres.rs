use async_trait::async_trait;
use onboard_core::saga::{NewSaga, Saga, SagaState, SagaTransition};
use onboard_core::types::{SagaId, Timestamp};
use onboard_db::repositories::SagaRepo;
use onboard_db::DbPool;

use super::SagaStore;
use crate::error::StoreError;

/// PostgreSQL-backed store over [`SagaRepo`].
#[derive(Clone)]
pub struct PgSagaStore {
    pool: DbPool,
}

impl PgSagaStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl SagaStore for PgSagaStore {
    async fn ping(&self) -> Result<(), StoreError> {
        onboard_db::health_check(&self.pool).await?;
        Ok(())
    }

    async fn insert_or_get(&self, new: &NewSaga) -> Result<(Saga, bool), StoreError> {
        Ok(SagaRepo::insert_or_get(&self.pool, new).await?)
    }

    async fn get(&self, id: SagaId) -> Result<Option<Saga>, StoreError> {
        Ok(SagaRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list(
        &self,
        state: Option<SagaState>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Saga>, StoreError> {
        Ok(SagaRepo::list(&self.pool, state, limit, offset).await?)
    }

    async fn list_stalled(&self, cutoff: Timestamp, limit: i64) -> Result<Vec<Saga>, StoreError> {
        Ok(SagaRepo::list_stalled(&self.pool, cutoff, limit).await?)
    }

    async fn transition(
        &self,
        current: &Saga,
        to: SagaState,
        detail: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Saga, StoreError> {
        current.state.ensure_transition(to)?;
        SagaRepo::transition(&self.pool, current, to, detail, last_error)
            .await?
            .ok_or(StoreError::Conflict {
                id: current.id,
                expected: current.version,
            })
    }

    async fn claim(&self, current: &Saga) -> Result<Saga, StoreError> {
        SagaRepo::claim(&self.pool, current)
            .await?
            .ok_or(StoreError::Conflict {
                id: current.id,
                expected: current.version,
            })
    }

    async fn transitions(&self, id: SagaId) -> Result<Vec<SagaTransition>, StoreError> {
        Ok(SagaRepo::list_transitions(&self.pool, id).await?)
    }
}
