//! Onboarding saga coordination.
//!
//! A `UserCreated` trigger becomes a [`Saga`](onboard_core::saga::Saga)
//! that the [`Coordinator`] drives through
//! `Started -> Provisioning -> Completed | Failed`:
//!
//! - [`store`]: the durable source of truth, behind the [`SagaStore`] seam.
//! - [`cache`]: read-through cache holding only terminal sagas.
//! - [`locks`]: per-saga serialization inside one process.
//! - [`provisioning`]: the workspace service client and its retry loop.
//! - [`dispatch`]: bounded, cancellable worker pool for saga work.
//! - [`sweeper`]: finds stalled sagas and hands them back to the pool.
//! - [`intake`]: turns inbound events (HTTP or bus) into dispatched work.

pub mod cache;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod intake;
pub mod locks;
pub mod metrics;
pub mod provisioning;
pub mod store;
pub mod sweeper;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::SagaCache;
pub use coordinator::{Coordinator, CoordinatorConfig};
pub use dispatch::Dispatcher;
pub use error::{CoordinatorError, StoreError};
pub use metrics::SagaMetrics;
pub use provisioning::{ProvisionOutcome, ProvisionRequest, Provisioner, ProvisioningClient};
pub use store::{PgSagaStore, SagaStore};
pub use sweeper::{SweepReport, Sweeper, SweeperConfig};
