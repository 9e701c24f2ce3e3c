//! Wire envelope shared by every message on the platform topics.

use chrono::{DateTime, Utc};
use onboard_core::trigger::InboundEvent;
use serde::{Deserialize, Serialize};

/// `{type, payload, timestamp}` as carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,

    /// Free-form JSON payload carrying event-specific data.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Create an envelope stamped with the current time.
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Drop the timestamp to get the shape the intake path understands.
    pub fn into_inbound(self) -> InboundEvent {
        InboundEvent {
            event_type: self.event_type,
            payload: self.payload,
        }
    }
}
