//! Superbridge Telemetry - Logging and request correlation for the gateway.
//!
//! This crate provides:
//! - Configurable logging setup with multiple formats and targets
//! - Request context for correlating one HTTP call with its upstream stream
//! - Integration with the tracing ecosystem
//!
//! # Example
//!
//! ```rust,no_run
//! use superbridge_telemetry::{LogConfig, LogFormat, setup_logging, RequestContext};
//!
//! # fn main() -> Result<(), superbridge_telemetry::TelemetryError> {
//! let config = LogConfig::new("info")
//!     .with_format(LogFormat::Compact)
//!     .with_directive("superbridge_gateway=debug");
//!
//! setup_logging(&config)?;
//!
//! let ctx = RequestContext::new("http")
//!     .with_operation("chat")
//!     .with_session_id(42);
//!
//! let span = ctx.span();
//! let _guard = span.enter();
//! tracing::info!("relaying chat");
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

mod context;
mod error;
mod logging;

pub use context::{RequestContext, RequestGuard};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::{
    FileLogConfig, FileRotation, LogConfig, LogFormat, LogTarget, setup_default_logging,
    setup_logging,
};
