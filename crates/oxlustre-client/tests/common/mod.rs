//! Common test utilities for client integration tests.

pub mod assertions;
pub mod harness;

pub use assertions::*;
pub use harness::{TestFs, init_tracing};
