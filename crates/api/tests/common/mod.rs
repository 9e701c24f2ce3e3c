#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use futures::StreamExt;
use http_body_util::BodyExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use onboard_api::config::{default_persistence_retry, BusConfig, ProvisioningConfig, ServerConfig};
use onboard_api::router::build_app_router;
use onboard_api::state::AppState;
use onboard_core::backoff::BackoffPolicy;
use onboard_events::{BusTopics, EventEnvelope, EventPublisher, InProcessBus, LocalEventLog, Subscription};
use onboard_saga::store::InMemorySagaStore;
use onboard_saga::testing::StubProvisioner;
use onboard_saga::SweeperConfig;

/// Build a test `ServerConfig` with safe defaults and no retry delays.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        database_url: "postgres://unused".to_string(),
        db_max_connections: 1,
        bus: BusConfig {
            url: None,
            topics: BusTopics::default(),
            consumer_group: "test".to_string(),
            fallback_log: None,
        },
        provisioning: ProvisioningConfig {
            base_url: "http://127.0.0.1:0".to_string(),
            timeout: Duration::from_secs(1),
            retry: BackoffPolicy::immediate(3),
        },
        persistence_retry: BackoffPolicy {
            initial_delay: Duration::ZERO,
            ..default_persistence_retry()
        },
        max_concurrent_sagas: 8,
        sweeper: SweeperConfig::default(),
        cache_capacity: 100,
    }
}

/// The application plus handles on its in-memory collaborators.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<InMemorySagaStore>,
    pub provisioner: Arc<StubProvisioner>,
    /// Observer on the primary topic; sees every outcome event.
    pub events: Subscription,
}

impl TestApp {
    /// Wait until every dispatched saga task has finished.
    pub async fn settle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.state.dispatcher.wait_idle())
            .await
            .expect("saga tasks settle");
    }

    /// Next event on the primary topic with the given type.
    pub async fn next_event(&mut self, event_type: &str) -> EventEnvelope {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let bytes = self.events.next().await.expect("bus open");
                let envelope = EventEnvelope::from_bytes(&bytes).unwrap();
                if envelope.event_type == event_type {
                    return envelope;
                }
            }
        })
        .await
        .expect("event published")
    }
}

/// Build the full application router over an in-memory store, the stub
/// provisioner and an in-process bus, using the production middleware stack.
pub async fn build_test_app(provisioner: StubProvisioner) -> TestApp {
    let config = test_config();
    let store = Arc::new(InMemorySagaStore::new());
    let provisioner = Arc::new(provisioner);

    let bus = Arc::new(InProcessBus::default());
    let publisher = EventPublisher::new(bus, config.bus.topics.clone(), LocalEventLog::log_only());
    let events = publisher
        .subscribe_primary("observer")
        .await
        .unwrap()
        .unwrap();

    let state = AppState::new(
        Arc::new(config.clone()),
        store.clone(),
        provisioner.clone(),
        Arc::new(publisher),
        CancellationToken::new(),
    )
    .unwrap();
    let router = build_app_router(state.clone(), &config).unwrap();

    TestApp {
        router,
        state,
        store,
        provisioner,
        events,
    }
}

pub async fn get(app: &TestApp, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn post_json(app: &TestApp, uri: &str, body: serde_json::Value) -> Response {
    post_raw(app, uri, body.to_string()).await
}

pub async fn post_raw(app: &TestApp, uri: &str, body: impl Into<Body>) -> Response {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap();
    app.router.clone().oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub fn user_created(user_id: &str) -> serde_json::Value {
    serde_json::json!({ "type": "UserCreated", "payload": { "userId": user_id } })
}

pub async fn assert_status(response: Response, status: StatusCode) -> Response {
    assert_eq!(response.status(), status);
    response
}
