//! In-memory [`SagaStore`] for tests and local runs without PostgreSQL.
//!
//! Applies the same rules as the PostgreSQL store: one saga per subject,
//! legal forward steps only, version compare-and-set on every write, and an
//! audit row per state change. Writes can be made to fail on demand to
//! exercise the coordinator's retry and fail-closed paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use onboard_core::pagination::{clamp_limit, clamp_offset};
use onboard_core::saga::{NewSaga, Saga, SagaState, SagaTransition};
use onboard_core::types::{SagaId, Timestamp};

use super::SagaStore;
use crate::error::StoreError;

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 500;

#[derive(Default)]
struct Inner {
    sagas: HashMap<SagaId, Saga>,
    by_subject: HashMap<String, SagaId>,
    transitions: Vec<SagaTransition>,
}

#[derive(Default)]
pub struct InMemorySagaStore {
    inner: Mutex<Inner>,
    /// Number of upcoming writes that fail with [`StoreError::Unavailable`].
    failing_writes: AtomicU32,
    /// When set, every write fails.
    writes_down: AtomicBool,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make every write fail until called again with `false`.
    pub fn set_writes_down(&self, down: bool) {
        self.writes_down.store(down, Ordering::SeqCst);
    }

    /// Put a saga in place as-is, e.g. one left mid-flight by a crash.
    pub fn seed(&self, saga: Saga) {
        let mut inner = self.lock();
        inner.by_subject.insert(saga.subject_id.clone(), saga.id);
        inner.transitions.push(SagaTransition {
            saga_id: saga.id,
            from_state: None,
            to_state: SagaState::Started,
            detail: None,
            created_at: saga.created_at,
        });
        if saga.state != SagaState::Started {
            inner.transitions.push(SagaTransition {
                saga_id: saga.id,
                from_state: Some(SagaState::Started),
                to_state: saga.state,
                detail: None,
                created_at: saga.updated_at,
            });
        }
        inner.sagas.insert(saga.id, saga);
    }

    pub fn len(&self) -> usize {
        self.lock().sagas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.writes_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is down".into()));
        }
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        Ok(())
    }

    /// Compare-and-set shared by `transition` and `claim`.
    fn write(
        &self,
        current: &Saga,
        to: SagaState,
        detail: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Saga, StoreError> {
        self.check_write()?;
        let mut inner = self.lock();
        let stored = inner
            .sagas
            .get_mut(&current.id)
            .ok_or(StoreError::NotFound(current.id))?;
        if stored.version != current.version || stored.state != current.state {
            return Err(StoreError::Conflict {
                id: current.id,
                expected: current.version,
            });
        }

        let now = Utc::now();
        stored.state = to;
        stored.version += 1;
        stored.updated_at = now;
        if let Some(err) = last_error {
            stored.last_error = Some(err.to_string());
        }
        let updated = stored.clone();

        if to != current.state {
            inner.transitions.push(SagaTransition {
                saga_id: current.id,
                from_state: Some(current.state),
                to_state: to,
                detail: detail.map(str::to_string),
                created_at: now,
            });
        }
        Ok(updated)
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert_or_get(&self, new: &NewSaga) -> Result<(Saga, bool), StoreError> {
        self.check_write()?;
        let mut inner = self.lock();
        if let Some(existing) = inner
            .by_subject
            .get(&new.subject_id)
            .and_then(|id| inner.sagas.get(id))
        {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let saga = Saga {
            id: new.id,
            subject_id: new.subject_id.clone(),
            state: SagaState::Started,
            payload: new.payload.clone(),
            version: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        inner.by_subject.insert(saga.subject_id.clone(), saga.id);
        inner.sagas.insert(saga.id, saga.clone());
        inner.transitions.push(SagaTransition {
            saga_id: saga.id,
            from_state: None,
            to_state: SagaState::Started,
            detail: None,
            created_at: now,
        });
        Ok((saga, true))
    }

    async fn get(&self, id: SagaId) -> Result<Option<Saga>, StoreError> {
        Ok(self.lock().sagas.get(&id).cloned())
    }

    async fn list(
        &self,
        state: Option<SagaState>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Saga>, StoreError> {
        let limit = clamp_limit(limit, DEFAULT_LIMIT, MAX_LIMIT) as usize;
        let offset = clamp_offset(offset) as usize;
        let mut sagas: Vec<Saga> = self
            .lock()
            .sagas
            .values()
            .filter(|s| state.map_or(true, |want| s.state == want))
            .cloned()
            .collect();
        sagas.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(sagas.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_stalled(&self, cutoff: Timestamp, limit: i64) -> Result<Vec<Saga>, StoreError> {
        let mut stalled: Vec<Saga> = self
            .lock()
            .sagas
            .values()
            .filter(|s| !s.state.is_terminal() && s.updated_at < cutoff)
            .cloned()
            .collect();
        stalled.sort_by_key(|s| s.updated_at);
        stalled.truncate(limit.max(1) as usize);
        Ok(stalled)
    }

    async fn transition(
        &self,
        current: &Saga,
        to: SagaState,
        detail: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Saga, StoreError> {
        current.state.ensure_transition(to)?;
        self.write(current, to, detail, last_error)
    }

    async fn claim(&self, current: &Saga) -> Result<Saga, StoreError> {
        self.write(current, current.state, None, None)
    }

    async fn transitions(&self, id: SagaId) -> Result<Vec<SagaTransition>, StoreError> {
        Ok(self
            .lock()
            .transitions
            .iter()
            .filter(|t| t.saga_id == id)
            .cloned()
            .collect())
    }
}
