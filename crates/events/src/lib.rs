//! Event bus client for the onboarding coordinator.
//!
//! - [`EventEnvelope`]: the `{type, payload, timestamp}` wire envelope.
//! - [`EventTransport`]: the publish/subscribe seam, implemented by
//!   [`NatsTransport`] (queue-group consumers across replicas) and
//!   [`InProcessBus`] (single-process broadcast).
//! - [`EventPublisher`]: primary topic, then dead-letter topic, then the
//!   [`LocalEventLog`]; an event is never dropped without a trace.

pub mod envelope;
pub mod fallback;
pub mod memory;
pub mod nats;
pub mod publisher;
pub mod transport;

pub use envelope::EventEnvelope;
pub use fallback::LocalEventLog;
pub use memory::InProcessBus;
pub use nats::NatsTransport;
pub use publisher::{BusTopics, Delivery, EventPublisher, PublishError};
pub use transport::{BusError, EventTransport, Subscription};
