//! Prometheus metrics for saga coordination.
//!
//! Each [`SagaMetrics`] owns its registry, so tests and multiple app
//! instances in one process never collide on registration.

use prometheus::{Encoder, TextEncoder};

#[derive(Clone)]
pub struct SagaMetrics {
    registry: prometheus::Registry,

    /// Inbound events by `source` (http, bus) and `outcome`.
    pub events_received: prometheus::IntCounterVec,
    /// Sagas created by a trigger.
    pub sagas_started: prometheus::IntCounter,
    /// Triggers that matched an existing saga.
    pub sagas_deduplicated: prometheus::IntCounter,
    /// Sagas reaching a terminal state, by `state`.
    pub saga_outcomes: prometheus::IntCounterVec,
    /// Trigger-to-terminal time in seconds, by `state`.
    pub saga_duration: prometheus::HistogramVec,
    /// Provisioning calls by `result` (success, failure).
    pub provisioning_attempts: prometheus::IntCounterVec,
    /// Failed state writes that were retried.
    pub persistence_retries: prometheus::IntCounter,
    /// Outcome events by `destination` (primary, dead_letter, local_log, undeliverable).
    pub events_published: prometheus::IntCounterVec,
    pub sweeps: prometheus::IntCounter,
    /// Stalled sagas handed back to the dispatcher by the sweeper.
    pub sagas_resumed: prometheus::IntCounter,
    /// Saga tasks currently holding a dispatcher permit.
    pub in_flight: prometheus::IntGauge,
}

impl SagaMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = prometheus::Registry::new_custom(Some("onboard".to_string()), None)?;

        let events_received = prometheus::IntCounterVec::new(
            prometheus::opts!("events_received_total", "Inbound events by source and outcome"),
            &["source", "outcome"],
        )?;
        registry.register(Box::new(events_received.clone()))?;

        let sagas_started = prometheus::IntCounter::with_opts(prometheus::opts!(
            "sagas_started_total",
            "Sagas created from a trigger"
        ))?;
        registry.register(Box::new(sagas_started.clone()))?;

        let sagas_deduplicated = prometheus::IntCounter::with_opts(prometheus::opts!(
            "sagas_deduplicated_total",
            "Triggers that matched an existing saga"
        ))?;
        registry.register(Box::new(sagas_deduplicated.clone()))?;

        let saga_outcomes = prometheus::IntCounterVec::new(
            prometheus::opts!("saga_outcomes_total", "Sagas reaching a terminal state"),
            &["state"],
        )?;
        registry.register(Box::new(saga_outcomes.clone()))?;

        let saga_duration = prometheus::HistogramVec::new(
            prometheus::histogram_opts!(
                "saga_duration_seconds",
                "Time from trigger to terminal state",
                vec![0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0]
            ),
            &["state"],
        )?;
        registry.register(Box::new(saga_duration.clone()))?;

        let provisioning_attempts = prometheus::IntCounterVec::new(
            prometheus::opts!("provisioning_attempts_total", "Provisioning calls by result"),
            &["result"],
        )?;
        registry.register(Box::new(provisioning_attempts.clone()))?;

        let persistence_retries = prometheus::IntCounter::with_opts(prometheus::opts!(
            "persistence_retries_total",
            "Saga state writes retried after a store error"
        ))?;
        registry.register(Box::new(persistence_retries.clone()))?;

        let events_published = prometheus::IntCounterVec::new(
            prometheus::opts!("events_published_total", "Outcome events by destination"),
            &["destination"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let sweeps = prometheus::IntCounter::with_opts(prometheus::opts!(
            "sweeps_total",
            "Reconciliation sweeps run"
        ))?;
        registry.register(Box::new(sweeps.clone()))?;

        let sagas_resumed = prometheus::IntCounter::with_opts(prometheus::opts!(
            "sagas_resumed_total",
            "Stalled sagas dispatched by a sweep"
        ))?;
        registry.register(Box::new(sagas_resumed.clone()))?;

        let in_flight = prometheus::IntGauge::with_opts(prometheus::opts!(
            "sagas_in_flight",
            "Saga tasks currently running"
        ))?;
        registry.register(Box::new(in_flight.clone()))?;

        Ok(Self {
            registry,
            events_received,
            sagas_started,
            sagas_deduplicated,
            saga_outcomes,
            saga_duration,
            provisioning_attempts,
            persistence_retries,
            events_published,
            sweeps,
            sagas_resumed,
            in_flight,
        })
    }

    pub fn registry(&self) -> &prometheus::Registry {
        &self.registry
    }

    pub fn record_event(&self, source: &str, outcome: &str) {
        self.events_received
            .with_label_values(&[source, outcome])
            .inc();
    }

    pub fn record_provisioning(&self, succeeded: bool, failures: u32) {
        self.provisioning_attempts
            .with_label_values(&["failure"])
            .inc_by(u64::from(failures));
        if succeeded {
            self.provisioning_attempts
                .with_label_values(&["success"])
                .inc();
        }
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
