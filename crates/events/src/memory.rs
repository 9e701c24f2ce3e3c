//! In-process event bus backed by `tokio::sync::broadcast` channels.
//!
//! [`InProcessBus`] keeps one broadcast channel per topic. Every subscriber
//! sees every message, so consumer groups degenerate to fan-out; that is
//! the right behaviour for a single process and for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;

use crate::transport::{BusError, EventTransport, Subscription};

/// Default buffer capacity for each topic's broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// When a topic's buffer is full, the oldest un-consumed messages are
/// dropped and slow subscribers skip ahead with a warning.
pub struct InProcessBus {
    capacity: usize,
    topics: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl InProcessBus {
    /// Create a bus with a specific per-topic channel capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl EventTransport for InProcessBus {
    fn name(&self) -> &'static str {
        "in-process"
    }

    /// Publish to all current subscribers of `topic`.
    ///
    /// With no subscribers the message is discarded; that is not an error
    /// for a broadcast bus.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let _ = self.sender(topic).send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _group: &str) -> Result<Subscription, BusError> {
        let receiver = self.sender(topic).subscribe();
        let topic = topic.to_string();

        let stream = futures::stream::unfold(
            (receiver, topic),
            |(mut receiver, topic)| async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => return Some((message, (receiver, topic))),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(topic = %topic, skipped = n, "In-process subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(stream.boxed())
    }
}
