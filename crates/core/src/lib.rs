//! Domain types shared by every onboarding crate.
//!
//! Nothing in here performs I/O: the saga state machine, trigger parsing,
//! retry policy arithmetic and workspace id derivation are all pure so that
//! the persistence, bus and HTTP layers agree on the same rules.

pub mod backoff;
pub mod error;
pub mod pagination;
pub mod saga;
pub mod trigger;
pub mod types;
pub mod workspace;
