//! Outcome publishing with dead-letter and local-log fallback.
//!
//! The envelope is serialized once and the very same bytes travel to every
//! destination that is tried, so a consumer of the dead-letter topic or the
//! fallback file sees exactly what the primary topic would have carried.

use std::sync::Arc;

use crate::envelope::EventEnvelope;
use crate::fallback::LocalEventLog;
use crate::transport::{EventTransport, Subscription};
use crate::BusError;

/// Default topic for platform events.
pub const DEFAULT_PRIMARY_TOPIC: &str = "platform.events";

/// Default topic for messages the primary topic refused.
pub const DEFAULT_DEAD_LETTER_TOPIC: &str = "platform.events.dlq";

/// Topic names used by the publisher and the subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusTopics {
    pub primary: String,
    pub dead_letter: String,
}

impl Default for BusTopics {
    fn default() -> Self {
        Self {
            primary: DEFAULT_PRIMARY_TOPIC.to_string(),
            dead_letter: DEFAULT_DEAD_LETTER_TOPIC.to_string(),
        }
    }
}

/// Where an event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Primary,
    DeadLetter,
    LocalLog,
}

impl Delivery {
    pub fn as_str(self) -> &'static str {
        match self {
            Delivery::Primary => "primary",
            Delivery::DeadLetter => "dead_letter",
            Delivery::LocalLog => "local_log",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Every destination refused the event. Its payload is still in the
    /// `event_fallback` log record.
    #[error("Event undeliverable: {0}")]
    Undeliverable(String),
}

/// Publishes envelopes with a guaranteed delivery attempt.
pub struct EventPublisher {
    transport: Option<Arc<dyn EventTransport>>,
    topics: BusTopics,
    fallback: LocalEventLog,
}

impl EventPublisher {
    pub fn new(transport: Arc<dyn EventTransport>, topics: BusTopics, fallback: LocalEventLog) -> Self {
        Self {
            transport: Some(transport),
            topics,
            fallback,
        }
    }

    /// A publisher with no bus: every event goes straight to the local log.
    pub fn local_only(fallback: LocalEventLog) -> Self {
        Self {
            transport: None,
            topics: BusTopics::default(),
            fallback,
        }
    }

    pub fn topics(&self) -> &BusTopics {
        &self.topics
    }

    pub fn transport(&self) -> Option<&Arc<dyn EventTransport>> {
        self.transport.as_ref()
    }

    /// Join the consumer group on the primary topic, if a bus is configured.
    pub async fn subscribe_primary(&self, group: &str) -> Result<Option<Subscription>, BusError> {
        match &self.transport {
            Some(transport) => transport.subscribe(&self.topics.primary, group).await.map(Some),
            None => Ok(None),
        }
    }

    /// Wrap `payload` in an envelope and publish it.
    pub async fn publish(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Delivery, PublishError> {
        self.publish_envelope(&EventEnvelope::new(event_type, payload)).await
    }

    /// Primary topic, then one dead-letter attempt, then the local log.
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> Result<Delivery, PublishError> {
        let bytes = envelope.to_bytes()?;

        if let Some(transport) = &self.transport {
            match transport.publish(&self.topics.primary, bytes.clone()).await {
                Ok(()) => {
                    tracing::debug!(
                        event_type = %envelope.event_type,
                        topic = %self.topics.primary,
                        "Event published"
                    );
                    return Ok(Delivery::Primary);
                }
                Err(e) => {
                    tracing::warn!(
                        event_type = %envelope.event_type,
                        error = %e,
                        "Primary publish failed, trying dead-letter topic"
                    );
                }
            }

            match transport.publish(&self.topics.dead_letter, bytes.clone()).await {
                Ok(()) => {
                    tracing::warn!(
                        event_type = %envelope.event_type,
                        topic = %self.topics.dead_letter,
                        "Event routed to dead-letter topic"
                    );
                    return Ok(Delivery::DeadLetter);
                }
                Err(e) => {
                    tracing::error!(
                        event_type = %envelope.event_type,
                        error = %e,
                        "Dead-letter publish failed, writing to local log"
                    );
                }
            }
        }

        self.fallback
            .append(&self.topics.primary, &bytes)
            .await
            .map_err(|e| PublishError::Undeliverable(e.to_string()))?;
        Ok(Delivery::LocalLog)
    }
}
