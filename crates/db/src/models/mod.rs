//! Row structs for the saga tables.
//!
//! Rows carry raw SMALLINT state ids; conversion into the domain types in
//! `onboard_core::saga` happens here so repositories hand out validated
//! values only.

pub mod saga;
