//! NATS transport.
//!
//! Publishing flushes before returning so that `Ok` means the server has the
//! message, which is what lets the publisher decide whether to fall back to
//! the dead-letter topic. Subscriptions use NATS queue groups: replicas that
//! join the same group compete for messages instead of each receiving a copy.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use crate::transport::{BusError, EventTransport, Subscription};

/// How long to wait for the initial connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Event bus transport over a NATS connection.
pub struct NatsTransport {
    client: async_nats::Client,
}

impl NatsTransport {
    /// Connect to `url` (comma-separated server list accepted).
    pub async fn connect(url: &str, client_name: &str) -> Result<Self, BusError> {
        let client = async_nats::ConnectOptions::new()
            .name(client_name)
            .connection_timeout(CONNECT_TIMEOUT)
            .connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        tracing::info!(url, client_name, "Connected to NATS");
        Ok(Self { client })
    }
}

#[async_trait]
impl EventTransport for NatsTransport {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let publish_err = |reason: String| BusError::Publish {
            topic: topic.to_string(),
            reason,
        };

        self.client
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| publish_err(e.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|e| publish_err(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError> {
        let subscriber = self
            .client
            .queue_subscribe(topic.to_string(), group.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(topic, group, "Joined NATS queue group");
        Ok(subscriber.map(|message| message.payload.to_vec()).boxed())
    }
}
