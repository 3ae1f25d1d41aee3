//! Prelude module - commonly used types for convenient import.
//!
//! Use `use superbridge_gateway::prelude::*;` to import all essential types.

// Errors
pub use crate::{ChatError, ErrorCategory, GatewayError, GatewayResult, ReadyError, ReadyFailure};

// Configuration
pub use crate::GatewayConfig;

// Controller and state
pub use crate::{Gateway, GatewayState, ReconnectReport};

// Chat
pub use crate::{ChatSession, ChatStream, SessionId};

// Health
pub use crate::{HealthReport, HealthSnapshot, HealthState};

// Upstream seam
pub use crate::{Connector, UpstreamChannel, UpstreamError, UpstreamTarget};
