use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use onboard_api::config::ServerConfig;
use onboard_api::router::build_app_router;
use onboard_api::state::AppState;
use onboard_events::{EventPublisher, LocalEventLog, NatsTransport};
use onboard_saga::intake::run_subscriber;
use onboard_saga::{PgSagaStore, ProvisioningClient, SagaStore};

/// How long background loops get to stop after cancellation.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    init_tracing();

    // --- Configuration ---
    let config = ServerConfig::from_env()?;
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Database ---
    let pool = onboard_db::create_pool(&config.database_url, config.db_max_connections)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connection pool created");

    onboard_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    tracing::info!("Database health check passed");

    onboard_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database migrations applied");

    let store: Arc<dyn SagaStore> = Arc::new(PgSagaStore::new(pool));

    // --- Event bus ---
    let fallback = match &config.bus.fallback_log {
        Some(path) => LocalEventLog::with_file(path),
        None => LocalEventLog::log_only(),
    };
    let publisher = match &config.bus.url {
        Some(url) => {
            let transport = NatsTransport::connect(url, &config.bus.consumer_group)
                .await
                .context("Failed to connect to event bus")?;
            EventPublisher::new(Arc::new(transport), config.bus.topics.clone(), fallback)
        }
        None => {
            tracing::warn!("EVENT_BUS_URL not set: bus intake disabled, events go to the local log");
            EventPublisher::local_only(fallback)
        }
    };
    let publisher = Arc::new(publisher);

    // --- Provisioning ---
    let provisioner = Arc::new(
        ProvisioningClient::new(&config.provisioning.base_url, config.provisioning.timeout)
            .context("Failed to build provisioning client")?,
    );
    tracing::info!(endpoint = provisioner.endpoint(), "Provisioning client ready");

    // --- App state ---
    let saga_cancel = CancellationToken::new();
    let state = AppState::new(
        Arc::new(config.clone()),
        store,
        provisioner,
        publisher.clone(),
        saga_cancel.clone(),
    )
    .context("Failed to register metrics")?;

    // --- Background loops ---
    let loops_cancel = CancellationToken::new();

    let subscriber_handle = match publisher.subscribe_primary(&config.bus.consumer_group).await? {
        Some(subscription) => Some(tokio::spawn(run_subscriber(
            subscription,
            Arc::clone(&state.dispatcher),
            loops_cancel.clone(),
        ))),
        None => None,
    };

    let sweeper_handle = tokio::spawn(Arc::clone(&state.sweeper).run(loops_cancel.clone()));

    let recovery_handle = tokio::spawn(
        Arc::clone(&state.sweeper).recover_on_startup(loops_cancel.clone()),
    );

    // --- Router ---
    let app = build_app_router(state.clone(), &config)?;

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().context("Invalid HOST address")?,
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    loops_cancel.cancel();
    if let Some(handle) = subscriber_handle {
        let _ = tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await;
    }
    let _ = tokio::time::timeout(TASK_STOP_TIMEOUT, sweeper_handle).await;
    let _ = tokio::time::timeout(TASK_STOP_TIMEOUT, recovery_handle).await;
    tracing::info!("Subscriber and sweeper stopped");

    let drained = state.dispatcher.shutdown(config.shutdown_timeout()).await;
    tracing::info!(drained, "Graceful shutdown complete");
    Ok(())
}

/// Install the global subscriber. `LOG_FORMAT=json` selects JSON lines.
fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "onboard_api=debug,onboard_saga=debug,tower_http=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
