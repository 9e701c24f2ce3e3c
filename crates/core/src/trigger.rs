//! Inbound trigger events and the event type names the coordinator speaks.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Identity-service event that starts an onboarding saga.
pub const EVENT_USER_CREATED: &str = "UserCreated";

/// Published once a saga reaches `Completed`.
pub const EVENT_SAGA_COMPLETED: &str = "SagaCompleted";

/// Published once a saga reaches `Failed`.
pub const EVENT_SAGA_FAILED: &str = "SagaFailed";

/// Maximum accepted length of a subject identifier.
pub const MAX_SUBJECT_ID_LEN: usize = 255;

/// Body of `POST /events` and the `{type, payload}` part of a bus envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default = "empty_object")]
    pub payload: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(Default::default())
}

/// A recognized trigger, validated and ready for the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Trigger {
    pub subject_id: String,
    /// The full trigger payload, persisted with the saga.
    pub payload: serde_json::Value,
}

impl Trigger {
    /// Interpret an inbound event.
    ///
    /// Returns `Ok(None)` for event types the coordinator does not handle and
    /// a validation error when a `UserCreated` payload has no usable `userId`.
    pub fn from_event(event: &InboundEvent) -> Result<Option<Self>, CoreError> {
        if event.event_type != EVENT_USER_CREATED {
            return Ok(None);
        }

        let subject_id = match event.payload.get("userId") {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            Some(_) => {
                return Err(CoreError::Validation(
                    "userId must be a string or number".into(),
                ))
            }
            None => return Err(CoreError::Validation("userId is required".into())),
        };

        if subject_id.is_empty() {
            return Err(CoreError::Validation("userId must not be empty".into()));
        }
        if subject_id.chars().count() > MAX_SUBJECT_ID_LEN {
            return Err(CoreError::Validation(format!(
                "userId exceeds {MAX_SUBJECT_ID_LEN} characters"
            )));
        }

        Ok(Some(Self {
            subject_id,
            payload: event.payload.clone(),
        }))
    }
}
