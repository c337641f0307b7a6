//! Shared identifiers and payload types used across the saga coordinator crates.

pub mod payload;
pub mod types;

pub use payload::{Payload, PayloadExt};
pub use types::SagaId;
