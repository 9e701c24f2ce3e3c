//! Drives one saga at a time through its state machine.
//!
//! Every step is written to the store before anything is announced: the
//! outcome event is published only after the terminal state is durable, and
//! a state write that keeps failing stops the saga where it is (fail closed)
//! so the sweeper can pick it up later. A version conflict means another
//! owner is driving the saga; this run backs off without touching it.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use onboard_core::backoff::BackoffPolicy;
use onboard_core::saga::{NewSaga, Saga, SagaState};
use onboard_core::trigger::{Trigger, EVENT_SAGA_COMPLETED, EVENT_SAGA_FAILED};
use onboard_core::types::{new_saga_id, SagaId};
use onboard_core::workspace::workspace_id_for;
use onboard_events::EventPublisher;
use tokio_util::sync::CancellationToken;

use crate::cache::SagaCache;
use crate::error::{CoordinatorError, StoreError};
use crate::locks::SagaLocks;
use crate::metrics::SagaMetrics;
use crate::provisioning::{provision_with_retry, ProvisionOutcome, ProvisionRequest, Provisioner};
use crate::store::SagaStore;

/// Retry policies for the two kinds of fallible work.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Calls to the provisioning service.
    pub provisioning: BackoffPolicy,
    /// Saga state writes.
    pub persistence: BackoffPolicy,
}

pub struct Coordinator {
    store: Arc<dyn SagaStore>,
    cache: Arc<SagaCache>,
    provisioner: Arc<dyn Provisioner>,
    publisher: Arc<EventPublisher>,
    metrics: SagaMetrics,
    locks: SagaLocks,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn SagaStore>,
        cache: Arc<SagaCache>,
        provisioner: Arc<dyn Provisioner>,
        publisher: Arc<EventPublisher>,
        metrics: SagaMetrics,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            provisioner,
            publisher,
            metrics,
            locks: SagaLocks::new(),
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn SagaStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<SagaCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &SagaMetrics {
        &self.metrics
    }

    /// Create the saga for `trigger` and drive it to a terminal state.
    ///
    /// A trigger for a subject that already has a saga is a duplicate
    /// delivery: the existing saga is returned untouched.
    pub async fn start(
        &self,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) -> Result<Saga, CoordinatorError> {
        let new = NewSaga {
            id: new_saga_id(),
            subject_id: trigger.subject_id,
            payload: trigger.payload,
        };
        let (saga, created) = self
            .with_write_retry("insert", new.id, || self.store.insert_or_get(&new))
            .await?;
        // A retried insert whose first attempt committed reads back our own row.
        let created = created || saga.id == new.id;

        if !created {
            self.metrics.sagas_deduplicated.inc();
            tracing::info!(
                saga_id = %saga.id,
                subject_id = %saga.subject_id,
                state = %saga.state,
                "Duplicate trigger, saga already exists"
            );
            return Ok(saga);
        }

        self.metrics.sagas_started.inc();
        tracing::info!(saga_id = %saga.id, subject_id = %saga.subject_id, "Saga started");

        let _guard = self.locks.lock(saga.id).await;
        let saga = self
            .advance(&saga, SagaState::Provisioning, Some("provisioning workspace"), None)
            .await?;
        self.drive(saga, cancel).await
    }

    /// Continue a saga from its stored state.
    ///
    /// Terminal sagas are returned as they are; re-driving one is a no-op.
    pub async fn resume(
        &self,
        id: SagaId,
        cancel: &CancellationToken,
    ) -> Result<Saga, CoordinatorError> {
        let _guard = self.locks.lock(id).await;

        let saga = self
            .with_write_retry("load", id, || self.store.get(id))
            .await?
            .ok_or(CoordinatorError::NotFound(id))?;

        let saga = match saga.state {
            SagaState::Completed | SagaState::Failed => {
                tracing::debug!(saga_id = %id, state = %saga.state, "Saga already terminal");
                self.cache.insert(&saga).await;
                return Ok(saga);
            }
            SagaState::Started => {
                self.advance(&saga, SagaState::Provisioning, Some("resumed"), None)
                    .await?
            }
            SagaState::Provisioning => {
                // The claim makes any other owner's next write lose its version check.
                let store = &self.store;
                let current = &saga;
                self.checked_write("claim", current, current.state, move || async move {
                    store.claim(current).await
                })
                .await?
            }
        };

        tracing::info!(saga_id = %id, subject_id = %saga.subject_id, "Resuming saga");
        self.drive(saga, cancel).await
    }

    /// Provision, then record and announce the outcome.
    async fn drive(&self, saga: Saga, cancel: &CancellationToken) -> Result<Saga, CoordinatorError> {
        let request = ProvisionRequest::for_saga(&saga);
        let outcome = provision_with_retry(
            self.provisioner.as_ref(),
            &request,
            &self.config.provisioning,
            cancel,
        )
        .await;
        let attempts_made = outcome.attempts();

        let done = match outcome {
            ProvisionOutcome::Succeeded { attempts } => {
                self.metrics.record_provisioning(true, attempts - 1);
                let detail = format!("workspace provisioned after {attempts} attempt(s)");
                self.advance(&saga, SagaState::Completed, Some(&detail), None)
                    .await?
            }
            ProvisionOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                self.metrics.record_provisioning(false, attempts);
                let detail = format!("provisioning gave up after {attempts} attempt(s)");
                self.advance(&saga, SagaState::Failed, Some(&detail), Some(&last_error))
                    .await?
            }
            ProvisionOutcome::Cancelled { attempts } => {
                self.metrics
                    .record_provisioning(false, attempts.saturating_sub(1));
                tracing::info!(
                    saga_id = %saga.id,
                    attempts,
                    "Saga interrupted by shutdown, left for the sweeper"
                );
                return Err(CoordinatorError::Cancelled(saga.id));
            }
        };

        self.cache.insert(&done).await;
        self.metrics
            .saga_outcomes
            .with_label_values(&[done.state.as_str()])
            .inc();
        let elapsed = (Utc::now() - done.created_at).num_milliseconds().max(0) as f64 / 1000.0;
        self.metrics
            .saga_duration
            .with_label_values(&[done.state.as_str()])
            .observe(elapsed);

        self.publish_outcome(&done, attempts_made).await;
        Ok(done)
    }

    /// Write one state change, retrying store errors under the persistence policy.
    async fn advance(
        &self,
        saga: &Saga,
        to: SagaState,
        detail: Option<&str>,
        last_error: Option<&str>,
    ) -> Result<Saga, CoordinatorError> {
        let store = &self.store;
        let updated = self
            .checked_write("transition", saga, to, move || async move {
                store.transition(saga, to, detail, last_error).await
            })
            .await?;
        tracing::info!(
            saga_id = %saga.id,
            from = %saga.state,
            to = %updated.state,
            "Saga transitioned"
        );
        Ok(updated)
    }

    /// Run a versioned write of `current` that should leave it in `to`.
    ///
    /// A retryable failure can hide a write that did commit, in which case
    /// the retry loses its version check against our own row. After such a
    /// failure a conflict is settled by reading the row back: if it holds
    /// exactly the next version in the target state, the write is ours.
    async fn checked_write<F, Fut>(
        &self,
        op: &'static str,
        current: &Saga,
        to: SagaState,
        mut write: F,
    ) -> Result<Saga, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Saga, StoreError>>,
    {
        let uncertain = AtomicBool::new(false);
        let flag = &uncertain;
        let result = self
            .with_write_retry(op, current.id, move || {
                let attempt = write();
                async move {
                    let result = attempt.await;
                    if matches!(&result, Err(e) if e.is_retryable()) {
                        flag.store(true, Ordering::Relaxed);
                    }
                    result
                }
            })
            .await;

        match result {
            Err(StoreError::Conflict { id, expected }) if uncertain.load(Ordering::Relaxed) => {
                let stored = self
                    .with_write_retry("load", id, || self.store.get(id))
                    .await?;
                match stored {
                    Some(saga) if saga.state == to && saga.version == current.version + 1 => {
                        tracing::warn!(
                            saga_id = %id,
                            op,
                            state = %saga.state,
                            "Write committed before its failure was reported"
                        );
                        Ok(saga)
                    }
                    _ => Err(StoreError::Conflict { id, expected }),
                }
            }
            other => other,
        }
    }

    async fn with_write_retry<T, F, Fut>(
        &self,
        op: &'static str,
        saga_id: SagaId,
        mut write: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let started = Instant::now();
        let mut failed = 0;

        loop {
            let err = match write().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => e,
                Err(e) => return Err(e),
            };
            failed += 1;

            match self.config.persistence.next_delay(failed, started.elapsed()) {
                Some(delay) => {
                    self.metrics.persistence_retries.inc();
                    tracing::warn!(
                        %saga_id,
                        op,
                        attempt = failed,
                        error = %err,
                        "Saga store write failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::error!(
                        %saga_id,
                        op,
                        attempts = failed,
                        error = %err,
                        "Saga store write failed, saga halted"
                    );
                    return Err(err);
                }
            }
        }
    }

    async fn publish_outcome(&self, saga: &Saga, attempts: u32) {
        let (event_type, payload) = match saga.state {
            SagaState::Completed => (
                EVENT_SAGA_COMPLETED,
                serde_json::json!({
                    "sagaId": saga.id,
                    "subjectId": saga.subject_id,
                    "workspaceId": workspace_id_for(&saga.subject_id),
                    "attempts": attempts,
                }),
            ),
            SagaState::Failed => (
                EVENT_SAGA_FAILED,
                serde_json::json!({
                    "sagaId": saga.id,
                    "subjectId": saga.subject_id,
                    "reason": saga.last_error,
                    "attempts": attempts,
                }),
            ),
            _ => return,
        };

        match self.publisher.publish(event_type, payload).await {
            Ok(delivery) => {
                self.metrics
                    .events_published
                    .with_label_values(&[delivery.as_str()])
                    .inc();
            }
            Err(e) => {
                self.metrics
                    .events_published
                    .with_label_values(&["undeliverable"])
                    .inc();
                tracing::error!(saga_id = %saga.id, event_type, error = %e, "Outcome event lost");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use futures::StreamExt;
    use onboard_events::{BusTopics, EventEnvelope, InProcessBus, LocalEventLog, Subscription};

    use super::*;
    use crate::store::InMemorySagaStore;
    use crate::testing::StubProvisioner;

    struct Harness {
        store: Arc<InMemorySagaStore>,
        provisioner: Arc<StubProvisioner>,
        coordinator: Arc<Coordinator>,
        events: Subscription,
    }

    async fn harness(provisioner: StubProvisioner) -> Harness {
        let store = Arc::new(InMemorySagaStore::new());
        let provisioner = Arc::new(provisioner);
        let bus = Arc::new(InProcessBus::default());
        let publisher = EventPublisher::new(bus, BusTopics::default(), LocalEventLog::log_only());
        let events = publisher.subscribe_primary("test").await.unwrap().unwrap();
        let config = CoordinatorConfig {
            provisioning: BackoffPolicy::immediate(3),
            persistence: BackoffPolicy::immediate(3),
        };
        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            Arc::new(SagaCache::new(16)),
            provisioner.clone(),
            Arc::new(publisher),
            SagaMetrics::new().unwrap(),
            config,
        ));
        Harness {
            store,
            provisioner,
            coordinator,
            events,
        }
    }

    fn trigger(subject: &str) -> Trigger {
        Trigger {
            subject_id: subject.to_string(),
            payload: serde_json::json!({ "userId": subject }),
        }
    }

    fn states(trail: &[onboard_core::saga::SagaTransition]) -> Vec<SagaState> {
        trail.iter().map(|t| t.to_state).collect()
    }

    async fn next_event(events: &mut Subscription) -> EventEnvelope {
        let bytes = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .expect("event published")
            .expect("stream open");
        EventEnvelope::from_bytes(&bytes).unwrap()
    }

    #[tokio::test]
    async fn successful_saga_completes_and_announces_it() {
        let mut h = harness(StubProvisioner::succeeding()).await;

        let saga = h
            .coordinator
            .start(trigger("u1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(saga.state, SagaState::Completed);
        let trail = h.store.transitions(saga.id).await.unwrap();
        assert_eq!(
            states(&trail),
            vec![SagaState::Started, SagaState::Provisioning, SagaState::Completed]
        );

        let event = next_event(&mut h.events).await;
        assert_eq!(event.event_type, EVENT_SAGA_COMPLETED);
        assert_eq!(event.payload["sagaId"], saga.id.to_string());
        assert_eq!(event.payload["subjectId"], "u1");

        let request = &h.provisioner.requests()[0];
        assert_eq!(request.owner_id, "u1");
        assert_eq!(request.saga_id, saga.id);
    }

    #[tokio::test]
    async fn exhausted_provisioning_fails_after_exactly_three_attempts() {
        let mut h = harness(StubProvisioner::failing()).await;

        let saga = h
            .coordinator
            .start(trigger("u2"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(saga.state, SagaState::Failed);
        assert_eq!(h.provisioner.calls(), 3);
        assert!(saga.last_error.as_deref().unwrap().contains("503"));

        let event = next_event(&mut h.events).await;
        assert_eq!(event.event_type, EVENT_SAGA_FAILED);
        assert_eq!(event.payload["sagaId"], saga.id.to_string());
        assert_eq!(event.payload["attempts"], 3);
        assert!(event.payload["reason"].as_str().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn redelivered_trigger_does_not_create_a_second_saga() {
        let h = harness(StubProvisioner::succeeding()).await;
        let cancel = CancellationToken::new();

        let first = h.coordinator.start(trigger("u1"), &cancel).await.unwrap();
        let second = h.coordinator.start(trigger("u1"), &cancel).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(h.store.len(), 1);
        assert_eq!(h.provisioner.calls(), 1);
        assert_eq!(h.coordinator.metrics().sagas_deduplicated.get(), 1);
    }

    #[tokio::test]
    async fn resuming_a_terminal_saga_changes_nothing() {
        let mut h = harness(StubProvisioner::succeeding()).await;
        let cancel = CancellationToken::new();
        let done = h.coordinator.start(trigger("u1"), &cancel).await.unwrap();
        next_event(&mut h.events).await;

        let again = h.coordinator.resume(done.id, &cancel).await.unwrap();

        assert_eq!(again, done);
        assert_eq!(h.provisioner.calls(), 1);
        assert_eq!(h.store.transitions(done.id).await.unwrap().len(), 3);
        let no_event = tokio::time::timeout(Duration::from_millis(50), h.events.next()).await;
        assert!(no_event.is_err(), "terminal saga must not be announced twice");
    }

    #[tokio::test]
    async fn crashed_saga_in_provisioning_resumes_without_restarting() {
        let h = harness(StubProvisioner::succeeding()).await;
        let now = Utc::now();
        let stuck = Saga {
            id: new_saga_id(),
            subject_id: "u3".into(),
            state: SagaState::Provisioning,
            payload: serde_json::json!({ "userId": "u3" }),
            version: 1,
            last_error: None,
            created_at: now - chrono::Duration::minutes(10),
            updated_at: now - chrono::Duration::minutes(10),
        };
        h.store.seed(stuck.clone());

        let done = h
            .coordinator
            .resume(stuck.id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(done.state, SagaState::Completed);
        let trail = h.store.transitions(stuck.id).await.unwrap();
        assert_eq!(
            states(&trail),
            vec![SagaState::Started, SagaState::Provisioning, SagaState::Completed]
        );
    }

    #[tokio::test]
    async fn saga_left_in_started_is_resumed_through_provisioning() {
        let h = harness(StubProvisioner::succeeding()).await;
        let (saga, _) = h
            .store
            .insert_or_get(&NewSaga {
                id: new_saga_id(),
                subject_id: "u4".into(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();

        let done = h
            .coordinator
            .resume(saga.id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(done.state, SagaState::Completed);
        assert_eq!(h.store.transitions(saga.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn transient_write_failures_are_retried() {
        let h = harness(StubProvisioner::succeeding()).await;
        h.store.fail_next_writes(2);

        let saga = h
            .coordinator
            .start(trigger("u1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(saga.state, SagaState::Completed);
        assert_eq!(h.coordinator.metrics().persistence_retries.get(), 2);
    }

    #[tokio::test]
    async fn persistent_write_failure_halts_without_publishing() {
        let mut h = harness(StubProvisioner::succeeding()).await;
        let (saga, _) = h
            .store
            .insert_or_get(&NewSaga {
                id: new_saga_id(),
                subject_id: "u5".into(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();
        let saga = h
            .store
            .transition(&saga, SagaState::Provisioning, None, None)
            .await
            .unwrap();
        h.store.set_writes_down(true);

        let err = h
            .coordinator
            .resume(saga.id, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, CoordinatorError::Store(StoreError::Unavailable(_)));
        let stored = h.store.get(saga.id).await.unwrap().unwrap();
        assert_eq!(stored.state, SagaState::Provisioning);
        let no_event = tokio::time::timeout(Duration::from_millis(50), h.events.next()).await;
        assert!(no_event.is_err(), "nothing may be published for an unrecorded outcome");
    }

    #[tokio::test]
    async fn stale_owner_is_superseded() {
        let h = harness(StubProvisioner::succeeding()).await;
        let (saga, _) = h
            .store
            .insert_or_get(&NewSaga {
                id: new_saga_id(),
                subject_id: "u6".into(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();
        let provisioning = h
            .store
            .transition(&saga, SagaState::Provisioning, None, None)
            .await
            .unwrap();
        // Another replica claims the saga while this copy is in hand.
        h.store.claim(&provisioning).await.unwrap();

        let err = h
            .coordinator
            .drive(provisioning, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, CoordinatorError::Superseded(id) if id == saga.id);
    }

    #[tokio::test]
    async fn cancelled_run_leaves_saga_in_provisioning() {
        let h = harness(StubProvisioner::failing()).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.coordinator.start(trigger("u7"), &cancel).await.unwrap_err();

        assert_matches!(err, CoordinatorError::Cancelled(_));
        let saga = &h.store.list(None, None, None).await.unwrap()[0];
        assert_eq!(saga.state, SagaState::Provisioning);
    }

    #[tokio::test]
    async fn terminal_saga_is_cached() {
        let h = harness(StubProvisioner::succeeding()).await;
        let saga = h
            .coordinator
            .start(trigger("u1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(h.coordinator.cache().get(saga.id).await, Some(saga));
    }

    #[tokio::test]
    async fn outcome_falls_back_to_local_log_without_a_bus() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let store = Arc::new(InMemorySagaStore::new());
        let coordinator = Coordinator::new(
            store,
            Arc::new(SagaCache::default()),
            Arc::new(StubProvisioner::succeeding()),
            Arc::new(EventPublisher::local_only(LocalEventLog::with_file(&path))),
            SagaMetrics::new().unwrap(),
            CoordinatorConfig {
                provisioning: BackoffPolicy::immediate(3),
                persistence: BackoffPolicy::immediate(3),
            },
        );

        let saga = coordinator
            .start(trigger("u8"), &CancellationToken::new())
            .await
            .unwrap();

        let line = tokio::fs::read_to_string(&path).await.unwrap();
        let envelope = EventEnvelope::from_bytes(line.trim_end().as_bytes()).unwrap();
        assert_eq!(envelope.event_type, EVENT_SAGA_COMPLETED);
        assert_eq!(envelope.payload["sagaId"], saga.id.to_string());
        assert_eq!(
            coordinator
                .metrics()
                .events_published
                .with_label_values(&["local_log"])
                .get(),
            1
        );
    }

    /// Commits writes normally but reports the first matching one as failed.
    struct LostAckStore {
        inner: InMemorySagaStore,
        lose_insert: AtomicBool,
        lose_transition_to: std::sync::Mutex<Option<SagaState>>,
    }

    impl LostAckStore {
        fn losing_insert() -> Self {
            Self {
                inner: InMemorySagaStore::new(),
                lose_insert: AtomicBool::new(true),
                lose_transition_to: std::sync::Mutex::new(None),
            }
        }

        fn losing_transition_to(state: SagaState) -> Self {
            Self {
                inner: InMemorySagaStore::new(),
                lose_insert: AtomicBool::new(false),
                lose_transition_to: std::sync::Mutex::new(Some(state)),
            }
        }

        fn reset() -> StoreError {
            StoreError::Unavailable("connection reset after commit".into())
        }
    }

    #[async_trait::async_trait]
    impl SagaStore for LostAckStore {
        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }

        async fn insert_or_get(&self, new: &NewSaga) -> Result<(Saga, bool), StoreError> {
            let result = self.inner.insert_or_get(new).await?;
            if self.lose_insert.swap(false, Ordering::SeqCst) {
                return Err(Self::reset());
            }
            Ok(result)
        }

        async fn get(&self, id: SagaId) -> Result<Option<Saga>, StoreError> {
            self.inner.get(id).await
        }

        async fn list(
            &self,
            state: Option<SagaState>,
            limit: Option<i64>,
            offset: Option<i64>,
        ) -> Result<Vec<Saga>, StoreError> {
            self.inner.list(state, limit, offset).await
        }

        async fn list_stalled(
            &self,
            cutoff: onboard_core::types::Timestamp,
            limit: i64,
        ) -> Result<Vec<Saga>, StoreError> {
            self.inner.list_stalled(cutoff, limit).await
        }

        async fn transition(
            &self,
            current: &Saga,
            to: SagaState,
            detail: Option<&str>,
            last_error: Option<&str>,
        ) -> Result<Saga, StoreError> {
            let saga = self.inner.transition(current, to, detail, last_error).await?;
            let mut lose = self.lose_transition_to.lock().unwrap();
            if *lose == Some(to) {
                *lose = None;
                return Err(Self::reset());
            }
            Ok(saga)
        }

        async fn claim(&self, current: &Saga) -> Result<Saga, StoreError> {
            self.inner.claim(current).await
        }

        async fn transitions(
            &self,
            id: SagaId,
        ) -> Result<Vec<onboard_core::saga::SagaTransition>, StoreError> {
            self.inner.transitions(id).await
        }
    }

    async fn coordinator_over(store: Arc<dyn SagaStore>) -> (Coordinator, Subscription) {
        let bus = Arc::new(InProcessBus::default());
        let publisher = EventPublisher::new(bus, BusTopics::default(), LocalEventLog::log_only());
        let events = publisher.subscribe_primary("test").await.unwrap().unwrap();
        let coordinator = Coordinator::new(
            store,
            Arc::new(SagaCache::new(16)),
            Arc::new(StubProvisioner::succeeding()),
            Arc::new(publisher),
            SagaMetrics::new().unwrap(),
            CoordinatorConfig {
                provisioning: BackoffPolicy::immediate(3),
                persistence: BackoffPolicy::immediate(3),
            },
        );
        (coordinator, events)
    }

    #[tokio::test]
    async fn committed_terminal_write_with_lost_ack_is_still_announced() {
        let store = Arc::new(LostAckStore::losing_transition_to(SagaState::Completed));
        let (coordinator, mut events) = coordinator_over(store.clone()).await;

        let saga = coordinator
            .start(trigger("u1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(saga.state, SagaState::Completed);
        let trail = store.transitions(saga.id).await.unwrap();
        assert_eq!(
            states(&trail),
            vec![SagaState::Started, SagaState::Provisioning, SagaState::Completed]
        );
        let event = next_event(&mut events).await;
        assert_eq!(event.event_type, EVENT_SAGA_COMPLETED);
        assert_eq!(event.payload["sagaId"], saga.id.to_string());
        assert_eq!(coordinator.cache().get(saga.id).await, Some(saga));
    }

    #[tokio::test]
    async fn committed_insert_with_lost_ack_is_not_a_duplicate() {
        let store = Arc::new(LostAckStore::losing_insert());
        let (coordinator, mut events) = coordinator_over(store.clone()).await;

        let saga = coordinator
            .start(trigger("u1"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(saga.state, SagaState::Completed);
        assert_eq!(coordinator.metrics().sagas_started.get(), 1);
        assert_eq!(coordinator.metrics().sagas_deduplicated.get(), 0);
        assert_eq!(next_event(&mut events).await.event_type, EVENT_SAGA_COMPLETED);
    }

    #[tokio::test]
    async fn foreign_conflict_is_not_mistaken_for_a_lost_ack() {
        let store = Arc::new(LostAckStore::losing_transition_to(SagaState::Completed));
        let (coordinator, _events) = coordinator_over(store.clone()).await;
        let (saga, _) = store
            .insert_or_get(&NewSaga {
                id: new_saga_id(),
                subject_id: "u2".into(),
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();
        let provisioning = store
            .transition(&saga, SagaState::Provisioning, None, None)
            .await
            .unwrap();
        // Another replica claims it, so no stored row matches our next version.
        store.claim(&provisioning).await.unwrap();

        let err = coordinator
            .drive(provisioning, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_matches!(err, CoordinatorError::Superseded(id) if id == saga.id);
    }
}
