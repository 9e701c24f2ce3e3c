//! Read-through cache of terminal sagas.
//!
//! Only `Completed` and `Failed` sagas are admitted. They never change again,
//! so a cached entry can never disagree with the store and no invalidation is
//! needed. Non-terminal reads always go to the store. Capacity is bounded;
//! the oldest admitted entry is evicted first.

use std::collections::{HashMap, VecDeque};

use onboard_core::saga::Saga;
use onboard_core::types::SagaId;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::store::SagaStore;

/// Default number of cached sagas.
pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Default)]
struct Entries {
    sagas: HashMap<SagaId, Saga>,
    order: VecDeque<SagaId>,
}

pub struct SagaCache {
    capacity: usize,
    entries: RwLock<Entries>,
}

impl SagaCache {
    /// A capacity of zero disables caching.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(Entries::default()),
        }
    }

    pub async fn get(&self, id: SagaId) -> Option<Saga> {
        self.entries.read().await.sagas.get(&id).cloned()
    }

    /// Admit `saga` if it is terminal. Returns whether it was cached.
    pub async fn insert(&self, saga: &Saga) -> bool {
        if self.capacity == 0 || !saga.state.is_terminal() {
            return false;
        }

        let mut entries = self.entries.write().await;
        if entries.sagas.contains_key(&saga.id) {
            return true;
        }
        while entries.order.len() >= self.capacity {
            match entries.order.pop_front() {
                Some(oldest) => {
                    entries.sagas.remove(&oldest);
                }
                None => break,
            }
        }
        entries.order.push_back(saga.id);
        entries.sagas.insert(saga.id, saga.clone());
        true
    }

    /// Serve from cache, otherwise load from `store` and admit the result.
    pub async fn get_or_load(
        &self,
        store: &dyn SagaStore,
        id: SagaId,
    ) -> Result<Option<Saga>, StoreError> {
        if let Some(saga) = self.get(id).await {
            return Ok(Some(saga));
        }
        let loaded = store.get(id).await?;
        if let Some(saga) = &loaded {
            self.insert(saga).await;
        }
        Ok(loaded)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.sagas.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for SagaCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
