//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod saga_repo;

pub use saga_repo::{SagaListQuery, SagaRepo};
