use std::sync::Arc;

use onboard_events::EventPublisher;
use onboard_saga::{
    Coordinator, CoordinatorConfig, Dispatcher, Provisioner, SagaCache, SagaMetrics, SagaStore,
    Sweeper,
};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything inside is behind an `Arc` or is a handle.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Durable source of truth for sagas.
    pub store: Arc<dyn SagaStore>,
    /// Terminal sagas only.
    pub cache: Arc<SagaCache>,
    pub dispatcher: Arc<Dispatcher>,
    pub sweeper: Arc<Sweeper>,
    pub metrics: SagaMetrics,
}

impl AppState {
    /// Wire the coordinator, dispatcher and sweeper around `store`.
    ///
    /// `cancel` is the token saga work observes at shutdown.
    pub fn new(
        config: Arc<ServerConfig>,
        store: Arc<dyn SagaStore>,
        provisioner: Arc<dyn Provisioner>,
        publisher: Arc<EventPublisher>,
        cancel: CancellationToken,
    ) -> Result<Self, prometheus::Error> {
        let metrics = SagaMetrics::new()?;
        let cache = Arc::new(SagaCache::new(config.cache_capacity));

        let coordinator = Arc::new(Coordinator::new(
            store.clone(),
            cache.clone(),
            provisioner,
            publisher,
            metrics.clone(),
            CoordinatorConfig {
                provisioning: config.provisioning.retry.clone(),
                persistence: config.persistence_retry.clone(),
            },
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            coordinator,
            config.max_concurrent_sagas,
            cancel,
        ));
        let sweeper = Arc::new(Sweeper::new(
            store.clone(),
            dispatcher.clone(),
            config.sweeper.clone(),
        ));

        Ok(Self {
            config,
            store,
            cache,
            dispatcher,
            sweeper,
            metrics,
        })
    }
}
