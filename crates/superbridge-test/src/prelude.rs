//! Prelude module - commonly used types for convenient import.
//!
//! Use `use superbridge_test::prelude::*;` to import the mocks, the fixtures
//! and the gateway types most tests touch.

pub use crate::fixtures::*;
pub use crate::mock_server::*;
pub use crate::mock_upstream::*;

pub use superbridge_gateway::prelude::*;
pub use tokio_util::sync::CancellationToken;
