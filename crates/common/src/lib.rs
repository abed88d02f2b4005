//! Shared vocabulary for the saga coordination crates.

pub mod types;

pub use types::{InstanceId, ParseInstanceIdError, Payload};
