//! Upstream service abstraction.
//!
//! The gateway core only sees the two traits defined here. [`ws`] implements
//! them over JSON-RPC on a single WebSocket using the method set in
//! [`protocol`]; tests substitute scripted in-memory channels.

pub mod protocol;
pub mod ws;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::session::SessionId;

pub use protocol::{ChatChunk, ChatRequest, SessionSummary};
pub use ws::{WsConnector, WsUpstream};

/// Greeting reply that marks the model runtime as ready.
pub const MODELS_READY_ACK: &str = "ready";

/// Address of the upstream service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamTarget {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl UpstreamTarget {
    /// Create a target.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// WebSocket URL for this target.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Kind of link failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportFailure {
    /// The link could not be established in time.
    Timeout,
    /// The remote end refused the connection.
    Refused,
    /// No route to the remote host.
    Unreachable,
    /// An established link was closed.
    Closed,
    /// Any other transport failure.
    Other,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Refused => write!(f, "refused"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::Closed => write!(f, "closed"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Errors reported by an upstream channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// The channel is unusable.
    #[error("transport {kind}: {message}")]
    Transport {
        /// Failure kind.
        kind: TransportFailure,
        /// Detail message.
        message: String,
    },

    /// One operation exceeded its deadline; the channel may still be fine.
    #[error("{0} timed out")]
    Timeout(String),

    /// The upstream answered with an error object.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// The upstream sent a payload that could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl UpstreamError {
    /// Build a transport error.
    #[must_use]
    pub fn transport(kind: TransportFailure, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Whether the channel itself is unusable after this error.
    #[must_use]
    pub fn is_channel_fault(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

/// Result type for upstream channel operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Text chunks of one upstream chat call, in upstream order.
///
/// The stream ends after the upstream's completion marker. A failure ends it
/// with a single `Err` item. Dropping the stream aborts the upstream call.
pub type ChunkStream = Pin<Box<dyn Stream<Item = UpstreamResult<String>> + Send>>;

/// One open connection to the upstream service.
///
/// Implementations must allow concurrent calls, including several open
/// chat streams at once.
#[async_trait]
pub trait UpstreamChannel: Send + Sync {
    /// Cheap structural check that the link is still open. Never does I/O.
    fn is_alive(&self) -> bool;

    /// Middleware liveness greeting. An empty reply means the middleware is down.
    async fn say_hello(&self, name: &str) -> UpstreamResult<String>;

    /// Model runtime greeting. [`MODELS_READY_ACK`] means the models are loaded.
    async fn say_hello_llm(&self, name: &str) -> UpstreamResult<String>;

    /// Blocking model load. `Ok(false)` is a remote rejection.
    async fn load_models(&self) -> UpstreamResult<bool>;

    /// Open a streaming chat call.
    async fn chat(&self, request: ChatRequest) -> UpstreamResult<ChunkStream>;

    /// Sessions the upstream currently keeps history for.
    async fn chat_history(&self) -> UpstreamResult<Vec<SessionSummary>>;

    /// Drop the upstream history of a session.
    async fn remove_session(&self, session_id: SessionId) -> UpstreamResult<bool>;

    /// Tell the upstream this client is leaving.
    async fn disconnect_client(&self) -> UpstreamResult<()>;

    /// Close the link. Outstanding calls fail with a transport error.
    async fn close(&self);
}

/// Establishes upstream channels.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new link to `target`. Performs no application-level handshake.
    async fn open(
        &self,
        target: &UpstreamTarget,
        timeout: Duration,
    ) -> UpstreamResult<Arc<dyn UpstreamChannel>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_url_and_display() {
        let target = UpstreamTarget::new("localhost", 5006);
        assert_eq!(target.ws_url(), "ws://localhost:5006");
        assert_eq!(target.to_string(), "localhost:5006");
    }

    #[test]
    fn only_transport_errors_are_channel_faults() {
        assert!(UpstreamError::transport(TransportFailure::Closed, "x").is_channel_fault());
        assert!(!UpstreamError::Timeout("load".into()).is_channel_fault());
        assert!(
            !UpstreamError::Remote {
                code: 1,
                message: "m".into()
            }
            .is_channel_fault()
        );
        assert!(!UpstreamError::Protocol("bad".into()).is_channel_fault());
    }
}
