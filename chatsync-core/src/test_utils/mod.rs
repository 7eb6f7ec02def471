//! Shared helpers for unit tests, integration tests and benches

pub mod assertions;
pub mod async_helpers;
pub mod fixtures;

pub use assertions::*;
pub use async_helpers::*;
pub use fixtures::*;
