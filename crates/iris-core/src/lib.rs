//! Foundational low-level utilities shared across Iris crates.
//!
//! Provides time helpers and identifier minting used by the store, queue,
//! connectors, and pipeline workers.

pub mod id_utils;
pub mod time_utils;

pub use id_utils::mint_unique_id;
pub use time_utils::{current_unix_timestamp, current_unix_timestamp_ms};
