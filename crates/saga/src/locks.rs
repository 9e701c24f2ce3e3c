//! Per-saga mutual exclusion inside one process.
//!
//! Work on one saga is serialized; work on different sagas never waits on
//! each other. Entries are removed once the last holder and waiter are gone,
//! so the map only ever holds sagas with work in flight. Across processes the
//! store's version check is what prevents double ownership.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use onboard_core::types::SagaId;
use tokio::sync::OwnedMutexGuard;

type Slots = Arc<Mutex<HashMap<SagaId, Arc<tokio::sync::Mutex<()>>>>>;

#[derive(Default, Clone)]
pub struct SagaLocks {
    slots: Slots,
}

/// Held while a task owns a saga. Releases on drop.
pub struct SagaGuard {
    id: SagaId,
    slots: Slots,
    slot: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl SagaLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other task holds `id`, then hold it.
    pub async fn lock(&self, id: SagaId) -> SagaGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots.entry(id).or_default().clone()
        };
        let guard = slot.clone().lock_owned().await;
        SagaGuard {
            id,
            slots: self.slots.clone(),
            slot,
            guard: Some(guard),
        }
    }

    /// Number of sagas currently held or waited on.
    pub fn active(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Drop for SagaGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        // Only the map and this guard still reference the slot: nobody waits.
        let idle = slots
            .get(&self.id)
            .is_some_and(|s| Arc::ptr_eq(s, &self.slot) && Arc::strong_count(&self.slot) == 2);
        if idle {
            slots.remove(&self.id);
        }
    }
}
