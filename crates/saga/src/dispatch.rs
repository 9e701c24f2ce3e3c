//! Bounded, cancellable execution of saga work.
//!
//! Every piece of saga work (a new trigger, a resume, a sweep) is spawned on
//! one [`TaskTracker`] and must hold a [`Semaphore`] permit while it runs, so
//! at most `max_concurrent` sagas are driven at once and shutdown can wait
//! for all of them. Submission never blocks: callers on the HTTP path or the
//! bus subscriber get control back immediately.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use onboard_core::trigger::Trigger;
use onboard_core::types::SagaId;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::coordinator::Coordinator;
use crate::error::CoordinatorError;

/// Default cap on concurrently driven sagas.
pub const DEFAULT_MAX_CONCURRENT: usize = 64;

/// How long cancelled tasks get to unwind after the drain timeout.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

pub struct Dispatcher {
    coordinator: Arc<Coordinator>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    accepting: AtomicBool,
}

impl Dispatcher {
    pub fn new(coordinator: Arc<Coordinator>, max_concurrent: usize, cancel: CancellationToken) -> Self {
        Self {
            coordinator,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tracker: TaskTracker::new(),
            cancel,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether new work is still accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Tasks spawned and not yet finished, including those waiting for a permit.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Start a saga for `trigger`. Returns `false` once shutdown has begun.
    pub fn submit_trigger(&self, trigger: Trigger) -> bool {
        let subject_id = trigger.subject_id.clone();
        self.spawn_saga(move |coordinator, cancel| async move {
            let result = coordinator.start(trigger, &cancel).await;
            log_result("start", &subject_id, result);
        })
    }

    /// Resume a stored saga. Returns `false` once shutdown has begun.
    pub fn submit_resume(&self, id: SagaId) -> bool {
        self.spawn_saga(move |coordinator, cancel| async move {
            let result = coordinator.resume(id, &cancel).await;
            log_result("resume", &id.to_string(), result);
        })
    }

    /// Run `task` on the tracker without taking a saga permit.
    ///
    /// For work that itself submits sagas, such as a sweep.
    pub fn spawn_background<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.is_accepting() {
            return false;
        }
        self.tracker.spawn(task);
        true
    }

    fn spawn_saga<F, Fut>(&self, work: F) -> bool
    where
        F: FnOnce(Arc<Coordinator>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if !self.is_accepting() {
            tracing::warn!("Dispatcher is shutting down, work rejected");
            return false;
        }

        let coordinator = self.coordinator.clone();
        let permits = self.permits.clone();
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                _ = cancel.cancelled() => return,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };

            let _in_flight = InFlight::enter(coordinator.metrics().in_flight.clone());
            work(coordinator, cancel).await;
        });
        true
    }

    /// Wait until every spawned task has finished, then accept work again.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting work and give running tasks up to `timeout` to finish.
    ///
    /// Whatever is still running after that is cancelled; those sagas stay
    /// where they are for the next sweep. Returns `true` if everything
    /// finished on its own.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        self.tracker.close();

        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for saga tasks to finish");
        }

        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok() {
            tracing::info!("All saga tasks finished");
            return true;
        }

        tracing::warn!(
            remaining = self.tracker.len(),
            "Shutdown timeout reached, cancelling saga tasks"
        );
        self.cancel.cancel();
        if tokio::time::timeout(CANCEL_GRACE, self.tracker.wait()).await.is_err() {
            tracing::warn!(remaining = self.tracker.len(), "Abandoning saga tasks");
        }
        false
    }
}

/// Holds one unit of the in-flight gauge; released on drop, unwinding included.
struct InFlight(prometheus::IntGauge);

impl InFlight {
    fn enter(gauge: prometheus::IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.dec();
    }
}

fn log_result(op: &'static str, key: &str, result: Result<onboard_core::saga::Saga, CoordinatorError>) {
    match result {
        Ok(saga) => tracing::debug!(op, key, saga_id = %saga.id, state = %saga.state, "Saga task finished"),
        Err(CoordinatorError::Superseded(id)) => {
            tracing::info!(op, saga_id = %id, "Saga owned by another worker, stopping")
        }
        Err(CoordinatorError::Cancelled(id)) => {
            tracing::info!(op, saga_id = %id, "Saga task cancelled")
        }
        Err(e) => tracing::error!(op, key, error = %e, "Saga task failed"),
    }
}
