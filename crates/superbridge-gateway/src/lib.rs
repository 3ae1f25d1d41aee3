//! Superbridge Gateway - owner of the single connection to the upstream
//! inference service.
//!
//! This crate provides:
//! - A connection state machine with a fixed transition table
//! - Two-layer health probes (middleware and model runtime)
//! - Single-flight model loading shared by every waiting caller
//! - Chat stream relaying with per-call cancellation and bounded admission
//! - On-demand reconnection that re-derives state from scratch
//!
//! # Architecture
//!
//! ```text
//! Gateway (controller)
//! ├── StateMachine        one GatewayState, lock-free reads
//! ├── TransportChannel    at most one open upstream link
//! │   └── Connector / UpstreamChannel (JSON-RPC over WebSocket)
//! ├── HealthMonitor       sayHello + sayHelloLlm probes
//! ├── readiness gate      shared future around loadModels
//! └── chat proxy          producer task -> bounded pipe -> ChatStream
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use superbridge_gateway::{ChatSession, Gateway, GatewayConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), superbridge_gateway::GatewayError> {
//! let gateway = Gateway::with_websocket(GatewayConfig::default());
//! gateway.connect().await?;
//! gateway.ensure_ready().await?;
//!
//! let mut stream = gateway
//!     .chat(ChatSession::with_default_label(42), "hi", CancellationToken::new())
//!     .await?;
//! while let Some(chunk) = stream.next().await {
//!     print!("{}", chunk?);
//! }
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

pub mod config;
pub mod env;
pub mod error;
pub mod health;
pub mod session;
pub mod state;
pub mod transport;
pub mod upstream;

mod controller;
mod proxy;
mod readiness;
mod shared;

pub use config::{ChatConfig, GatewayConfig, TimeoutConfig, UpstreamConfig};
pub use controller::{Gateway, ReconnectReport};
pub use error::{ChatError, ErrorCategory, GatewayError, GatewayResult, ReadyError, ReadyFailure};
pub use health::{CallFailure, HealthMonitor, HealthReport, HealthSnapshot, HealthState};
pub use proxy::{CallId, ChatStream, InFlightCall};
pub use session::{ChatSession, SessionId};
pub use state::{GatewayState, StateMachine, Transition};
pub use transport::TransportChannel;
pub use upstream::{
    Connector, SessionSummary, TransportFailure, UpstreamChannel, UpstreamError, UpstreamResult,
    UpstreamTarget,
};
