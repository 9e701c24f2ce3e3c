//! The publish/subscribe seam.

use async_trait::async_trait;
use futures::stream::BoxStream;

/// Raw message payloads delivered to a subscriber, in arrival order.
pub type Subscription = BoxStream<'static, Vec<u8>>;

/// Error type for transport failures.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Failed to connect to event bus: {0}")]
    Connect(String),

    #[error("Failed to publish to {topic}: {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to subscribe to {topic}: {reason}")]
    Subscribe { topic: String, reason: String },
}

/// A message bus the coordinator can publish to and consume from.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Send one message. `Ok` means the transport accepted it.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Join `group` on `topic`. Members of one group compete for messages.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BusError>;
}
