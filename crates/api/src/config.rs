use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use onboard_core::backoff::BackoffPolicy;
use onboard_events::BusTopics;
use onboard_saga::dispatch::DEFAULT_MAX_CONCURRENT;
use onboard_saga::SweeperConfig;

/// Error returned when the environment cannot be turned into a [`ServerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Event bus connection settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// NATS server URL. Without it the service neither subscribes nor
    /// publishes to a bus; outcome events go to the local fallback log.
    pub url: Option<String>,
    pub topics: BusTopics,
    /// Queue group shared by all replicas.
    pub consumer_group: String,
    /// JSON-lines file for events the bus would not take.
    pub fallback_log: Option<PathBuf>,
}

/// Provisioning service settings.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    pub base_url: String,
    /// Timeout of a single HTTP attempt.
    pub timeout: Duration,
    pub retry: BackoffPolicy,
}

/// Server configuration loaded from environment variables.
///
/// Every field except `database_url` has a default suitable for local
/// development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// How long shutdown waits for in-flight sagas (default: `30`).
    pub shutdown_timeout_secs: u64,
    pub database_url: String,
    pub db_max_connections: u32,
    pub bus: BusConfig,
    pub provisioning: ProvisioningConfig,
    /// Retry policy for saga state writes.
    pub persistence_retry: BackoffPolicy,
    pub max_concurrent_sagas: usize,
    pub sweeper: SweeperConfig,
    pub cache_capacity: usize,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                           | Default                  |
    /// |-----------------------------------|--------------------------|
    /// | `HOST`                            | `0.0.0.0`                |
    /// | `PORT`                            | `3000`                   |
    /// | `CORS_ORIGINS`                    | `http://localhost:5173`  |
    /// | `REQUEST_TIMEOUT_SECS`            | `30`                     |
    /// | `SHUTDOWN_TIMEOUT_SECS`           | `30`                     |
    /// | `DATABASE_URL`                    | required                 |
    /// | `DB_MAX_CONNECTIONS`              | `20`                     |
    /// | `EVENT_BUS_URL`                   | unset                    |
    /// | `EVENT_BUS_PRIMARY_TOPIC`         | `platform.events`        |
    /// | `EVENT_BUS_DEAD_LETTER_TOPIC`     | `platform.events.dlq`    |
    /// | `EVENT_BUS_CONSUMER_GROUP`        | `onboarding-coordinator` |
    /// | `EVENT_FALLBACK_LOG`              | unset                    |
    /// | `PROVISIONING_URL`                | `http://localhost:8081`  |
    /// | `PROVISIONING_TIMEOUT_SECS`       | `10`                     |
    /// | `PROVISIONING_MAX_ATTEMPTS`       | `3`                      |
    /// | `PROVISIONING_INITIAL_BACKOFF_MS` | `200`                    |
    /// | `PROVISIONING_MAX_BACKOFF_MS`     | `5000`                   |
    /// | `PROVISIONING_MAX_ELAPSED_SECS`   | `60`                     |
    /// | `MAX_CONCURRENT_SAGAS`            | `64`                     |
    /// | `SWEEP_INTERVAL_SECS`             | unset                    |
    /// | `SWEEP_STALE_AFTER_SECS`          | `60`                     |
    /// | `SWEEP_BATCH_SIZE`                | `500`                    |
    /// | `SAGA_CACHE_CAPACITY`             | `10000`                  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let cors_origins: Vec<String> = env
            .string("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let database_url = env
            .optional::<String>("DATABASE_URL")?
            .filter(|s| !s.is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let defaults = BackoffPolicy::default();
        let retry = BackoffPolicy {
            max_attempts: env.parse("PROVISIONING_MAX_ATTEMPTS", defaults.max_attempts)?.max(1),
            initial_delay: Duration::from_millis(env.parse("PROVISIONING_INITIAL_BACKOFF_MS", 200)?),
            max_delay: Duration::from_millis(env.parse("PROVISIONING_MAX_BACKOFF_MS", 5000)?),
            max_elapsed: Some(Duration::from_secs(env.parse("PROVISIONING_MAX_ELAPSED_SECS", 60)?)),
            ..defaults
        };

        let sweeper = SweeperConfig {
            stale_after: Duration::from_secs(env.parse("SWEEP_STALE_AFTER_SECS", 60)?),
            batch_size: env.parse::<i64>("SWEEP_BATCH_SIZE", 500)?.max(1),
            interval: env
                .optional::<u64>("SWEEP_INTERVAL_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        };

        Ok(Self {
            host: env.string("HOST", "0.0.0.0"),
            port: env.parse("PORT", 3000)?,
            cors_origins,
            request_timeout_secs: env.parse("REQUEST_TIMEOUT_SECS", 30)?,
            shutdown_timeout_secs: env.parse("SHUTDOWN_TIMEOUT_SECS", 30)?,
            database_url,
            db_max_connections: env.parse("DB_MAX_CONNECTIONS", onboard_db::DEFAULT_MAX_CONNECTIONS)?,
            bus: BusConfig {
                url: env.optional::<String>("EVENT_BUS_URL")?.filter(|s| !s.is_empty()),
                topics: BusTopics {
                    primary: env.string("EVENT_BUS_PRIMARY_TOPIC", onboard_events::publisher::DEFAULT_PRIMARY_TOPIC),
                    dead_letter: env.string(
                        "EVENT_BUS_DEAD_LETTER_TOPIC",
                        onboard_events::publisher::DEFAULT_DEAD_LETTER_TOPIC,
                    ),
                },
                consumer_group: env.string("EVENT_BUS_CONSUMER_GROUP", "onboarding-coordinator"),
                fallback_log: env
                    .optional::<String>("EVENT_FALLBACK_LOG")?
                    .filter(|s| !s.is_empty())
                    .map(PathBuf::from),
            },
            provisioning: ProvisioningConfig {
                base_url: env.string("PROVISIONING_URL", "http://localhost:8081"),
                timeout: Duration::from_secs(env.parse("PROVISIONING_TIMEOUT_SECS", 10)?),
                retry,
            },
            persistence_retry: default_persistence_retry(),
            max_concurrent_sagas: env.parse("MAX_CONCURRENT_SAGAS", DEFAULT_MAX_CONCURRENT)?.max(1),
            sweeper,
            cache_capacity: env.parse("SAGA_CACHE_CAPACITY", onboard_saga::cache::DEFAULT_CAPACITY)?,
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// State writes retry quickly and give up within seconds; a store that stays
/// down that long is left to the sweeper.
pub fn default_persistence_retry() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 5,
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
        max_elapsed: Some(Duration::from_secs(10)),
        ..BackoffPolicy::default()
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str, default: &str) -> String {
        (self.lookup)(name).unwrap_or_else(|| default.to_string())
    }

    fn optional<T>(&self, name: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match (self.lookup)(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::Invalid {
                    name,
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
        }
    }

    fn parse<T>(&self, name: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.optional(name)?.unwrap_or(default))
    }
}
