//! Inbound events from HTTP and the bus, funnelled into the dispatcher.
//!
//! Both entry points share [`accept_event`], so a trigger behaves the same
//! whichever way it arrives. The bus subscriber also sees the coordinator's
//! own outcome events on the shared topic; those are ignored like any other
//! non-trigger type.

use std::sync::Arc;

use futures::StreamExt;
use onboard_core::error::CoreError;
use onboard_core::trigger::{InboundEvent, Trigger};
use onboard_events::{EventEnvelope, Subscription};
use tokio_util::sync::CancellationToken;

use crate::dispatch::Dispatcher;

/// What happened to an inbound event.
#[derive(Debug)]
pub enum Intake {
    /// A saga task was submitted.
    Dispatched,
    /// Not a trigger type; nothing to do.
    Ignored,
    /// A trigger with an unusable payload.
    Rejected(CoreError),
    /// The dispatcher is shutting down.
    Unavailable,
}

impl Intake {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intake::Dispatched => "dispatched",
            Intake::Ignored => "ignored",
            Intake::Rejected(_) => "rejected",
            Intake::Unavailable => "unavailable",
        }
    }
}

/// Classify `event` and submit a saga for it if it is a valid trigger.
pub fn accept_event(dispatcher: &Dispatcher, source: &'static str, event: &InboundEvent) -> Intake {
    let intake = match Trigger::from_event(event) {
        Ok(Some(trigger)) => {
            let subject_id = trigger.subject_id.clone();
            if dispatcher.submit_trigger(trigger) {
                tracing::info!(source, subject_id = %subject_id, "Trigger accepted");
                Intake::Dispatched
            } else {
                Intake::Unavailable
            }
        }
        Ok(None) => {
            tracing::debug!(source, event_type = %event.event_type, "Ignoring non-trigger event");
            Intake::Ignored
        }
        Err(e) => {
            tracing::warn!(source, event_type = %event.event_type, error = %e, "Rejected trigger");
            Intake::Rejected(e)
        }
    };

    dispatcher
        .coordinator()
        .metrics()
        .record_event(source, intake.as_str());
    intake
}

/// Consume `subscription` until it ends or `cancel` fires.
///
/// Undecodable messages and invalid triggers are logged and skipped; one bad
/// message never stops the loop.
pub async fn run_subscriber(
    mut subscription: Subscription,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) {
    tracing::info!("Event subscriber started");

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Event subscriber stopping");
                break;
            }
            message = subscription.next() => message,
        };

        let Some(bytes) = message else {
            tracing::warn!("Event subscription closed");
            break;
        };

        match EventEnvelope::from_bytes(&bytes) {
            Ok(envelope) => {
                accept_event(&dispatcher, "bus", &envelope.into_inbound());
            }
            Err(e) => {
                dispatcher
                    .coordinator()
                    .metrics()
                    .record_event("bus", "malformed");
                tracing::warn!(
                    error = %e,
                    message = %String::from_utf8_lossy(&bytes),
                    "Skipping malformed bus message"
                );
            }
        }
    }
}
