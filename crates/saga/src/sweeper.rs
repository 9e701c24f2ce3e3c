//! Reconciliation of stalled sagas.
//!
//! A saga whose process died mid-flight stays `Started` or `Provisioning`
//! forever unless something picks it up again. A sweep lists non-terminal
//! sagas that have not been written for `stale_after` and submits each one
//! to the dispatcher as a resume; it does not wait for them to finish.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;
use crate::error::StoreError;
use crate::store::SagaStore;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// A non-terminal saga untouched for this long is considered stalled.
    pub stale_after: Duration,
    /// Upper bound on sagas resumed per sweep.
    pub batch_size: i64,
    /// Period of the built-in timer. `None` leaves sweeps to explicit triggers.
    pub interval: Option<Duration>,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(60),
            batch_size: 500,
            interval: None,
        }
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Stalled sagas found.
    pub found: usize,
    /// Resumes accepted by the dispatcher.
    pub dispatched: usize,
}

pub struct Sweeper {
    store: Arc<dyn SagaStore>,
    dispatcher: Arc<Dispatcher>,
    config: SweeperConfig,
}

impl Sweeper {
    pub fn new(store: Arc<dyn SagaStore>, dispatcher: Arc<Dispatcher>, config: SweeperConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, StoreError> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - stale_after;

        let stalled = self
            .store
            .list_stalled(cutoff, self.config.batch_size)
            .await?;

        let mut report = SweepReport {
            found: stalled.len(),
            dispatched: 0,
        };
        for saga in &stalled {
            if !self.dispatcher.submit_resume(saga.id) {
                break;
            }
            report.dispatched += 1;
        }

        let metrics = self.dispatcher.coordinator().metrics();
        metrics.sweeps.inc();
        metrics.sagas_resumed.inc_by(report.dispatched as u64);

        if report.found > 0 {
            tracing::info!(
                found = report.found,
                dispatched = report.dispatched,
                "Sweep dispatched stalled sagas"
            );
        } else {
            tracing::debug!("Sweep found no stalled sagas");
        }
        Ok(report)
    }

    async fn sweep_logged(&self) {
        if let Err(e) = self.sweep_once().await {
            tracing::error!(error = %e, "Sweep failed");
        }
    }

    /// Run a sweep in the background. Returns `false` during shutdown.
    pub fn trigger(self: &Arc<Self>) -> bool {
        let sweeper = Arc::clone(self);
        self.dispatcher
            .spawn_background(async move { sweeper.sweep_logged().await })
    }

    /// Pick up sagas a previous process left behind.
    ///
    /// Sweeps once immediately and once more after `stale_after`: sagas the
    /// old process wrote just before it died only count as stalled by then.
    pub async fn recover_on_startup(self: Arc<Self>, cancel: CancellationToken) {
        self.sweep_logged().await;

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.stale_after) => {}
        }

        tracing::info!("Running delayed startup sweep");
        self.sweep_logged().await;
    }

    /// Sweep on the configured interval until `cancel` fires.
    ///
    /// Returns immediately when no interval is configured.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(period) = self.config.interval else {
            tracing::info!("Periodic sweeps disabled");
            return;
        };

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_secs = period.as_secs(), "Sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Sweeper stopping");
                    break;
                }
                _ = interval.tick() => self.sweep_logged().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use onboard_core::backoff::BackoffPolicy;
    use onboard_core::saga::{Saga, SagaState};
    use onboard_core::types::new_saga_id;
    use onboard_events::{EventPublisher, LocalEventLog};

    use super::*;
    use crate::cache::SagaCache;
    use crate::coordinator::{Coordinator, CoordinatorConfig};
    use crate::metrics::SagaMetrics;
    use crate::store::InMemorySagaStore;
    use crate::testing::StubProvisioner;

    struct Harness {
        store: Arc<InMemorySagaStore>,
        provisioner: Arc<StubProvisioner>,
        dispatcher: Arc<Dispatcher>,
        sweeper: Arc<Sweeper>,
    }

    fn harness(config: SweeperConfig) -> Harness {
        let store = Arc::new(InMemorySagaStore::new());
        let provisioner = Arc::new(StubProvisioner::succeeding());
        let coordinator = Coordinator::new(
            store.clone(),
            Arc::new(SagaCache::default()),
            provisioner.clone(),
            Arc::new(EventPublisher::local_only(LocalEventLog::log_only())),
            SagaMetrics::new().unwrap(),
            CoordinatorConfig {
                provisioning: BackoffPolicy::immediate(3),
                persistence: BackoffPolicy::immediate(3),
            },
        );
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(coordinator),
            8,
            CancellationToken::new(),
        ));
        let sweeper = Arc::new(Sweeper::new(store.clone(), dispatcher.clone(), config));
        Harness {
            store,
            provisioner,
            dispatcher,
            sweeper,
        }
    }

    fn seeded(subject: &str, state: SagaState, idle: chrono::Duration) -> Saga {
        let at = Utc::now() - idle;
        Saga {
            id: new_saga_id(),
            subject_id: subject.into(),
            state,
            payload: serde_json::json!({ "userId": subject }),
            version: 1,
            last_error: None,
            created_at: at,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn stalled_sagas_are_resumed_to_completion() {
        let h = harness(SweeperConfig::default());
        let stuck = seeded("u1", SagaState::Provisioning, chrono::Duration::minutes(5));
        let early = seeded("u2", SagaState::Started, chrono::Duration::minutes(5));
        h.store.seed(stuck.clone());
        h.store.seed(early.clone());

        let report = h.sweeper.sweep_once().await.unwrap();
        h.dispatcher.wait_idle().await;

        assert_eq!(report, SweepReport { found: 2, dispatched: 2 });
        for id in [stuck.id, early.id] {
            let saga = h.store.get(id).await.unwrap().unwrap();
            assert_eq!(saga.state, SagaState::Completed);
        }
        assert_eq!(h.provisioner.calls(), 2);
    }

    #[tokio::test]
    async fn fresh_and_terminal_sagas_are_left_alone() {
        let h = harness(SweeperConfig::default());
        h.store
            .seed(seeded("fresh", SagaState::Provisioning, chrono::Duration::seconds(1)));
        h.store
            .seed(seeded("done", SagaState::Completed, chrono::Duration::hours(1)));
        h.store
            .seed(seeded("gone", SagaState::Failed, chrono::Duration::hours(1)));

        let report = h.sweeper.sweep_once().await.unwrap();
        h.dispatcher.wait_idle().await;

        assert_eq!(report, SweepReport::default());
        assert_eq!(h.provisioner.calls(), 0);
    }

    #[tokio::test]
    async fn batch_size_bounds_one_sweep() {
        let h = harness(SweeperConfig {
            batch_size: 2,
            ..SweeperConfig::default()
        });
        for subject in ["a", "b", "c"] {
            h.store
                .seed(seeded(subject, SagaState::Started, chrono::Duration::minutes(5)));
        }

        let report = h.sweeper.sweep_once().await.unwrap();
        h.dispatcher.wait_idle().await;

        assert_eq!(report.found, 2);
        let remaining = h.sweeper.sweep_once().await.unwrap();
        assert_eq!(remaining.found, 1);
        h.dispatcher.wait_idle().await;
    }

    #[tokio::test]
    async fn sweep_after_shutdown_dispatches_nothing() {
        let h = harness(SweeperConfig::default());
        h.store
            .seed(seeded("u1", SagaState::Provisioning, chrono::Duration::minutes(5)));
        h.dispatcher.shutdown(Duration::from_millis(100)).await;

        let report = h.sweeper.sweep_once().await.unwrap();

        assert_eq!(report, SweepReport { found: 1, dispatched: 0 });
        assert!(!h.sweeper.trigger());
    }

    #[tokio::test]
    async fn background_trigger_runs_a_sweep() {
        let h = harness(SweeperConfig::default());
        h.store
            .seed(seeded("u1", SagaState::Provisioning, chrono::Duration::minutes(5)));

        assert!(h.sweeper.trigger());
        h.dispatcher.wait_idle().await;

        assert_eq!(h.provisioner.calls(), 1);
        assert_eq!(h.dispatcher.coordinator().metrics().sweeps.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_run_stops_on_cancel() {
        let h = harness(SweeperConfig {
            interval: Some(Duration::from_secs(30)),
            ..SweeperConfig::default()
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.sweeper.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(65)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(h.dispatcher.coordinator().metrics().sweeps.get(), 3);
    }

    #[tokio::test]
    async fn run_without_interval_returns_immediately() {
        let h = harness(SweeperConfig::default());
        h.sweeper.clone().run(CancellationToken::new()).await;
    }

    #[tokio::test]
    async fn startup_recovery_resumes_sagas_that_become_stale() {
        let h = harness(SweeperConfig {
            stale_after: Duration::from_millis(200),
            ..SweeperConfig::default()
        });
        // Written moments before the previous process died.
        let recent = seeded("u1", SagaState::Provisioning, chrono::Duration::zero());
        h.store.seed(recent.clone());

        let task = tokio::spawn(h.sweeper.clone().recover_on_startup(CancellationToken::new()));
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("startup recovery finishes")
            .unwrap();
        h.dispatcher.wait_idle().await;

        let metrics = h.dispatcher.coordinator().metrics();
        assert_eq!(metrics.sweeps.get(), 2);
        assert_eq!(metrics.sagas_resumed.get(), 1);
        let saga = h.store.get(recent.id).await.unwrap().unwrap();
        assert_eq!(saga.state, SagaState::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn startup_recovery_stops_on_cancel() {
        let h = harness(SweeperConfig::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(h.sweeper.clone().recover_on_startup(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(h.dispatcher.coordinator().metrics().sweeps.get(), 1);
    }
}
