//! Error types for the gateway.
//!
//! Errors split along the blast radius of a failure:
//! - [`GatewayError::Transport`] means the upstream channel itself is unusable
//!   and the gateway has moved (or is moving) to `Degraded`.
//! - [`ReadyError`] means the channel is fine but the models are not loaded.
//! - [`ChatError`] is scoped to one chat call and never touches gateway state.
//!
//! Caller cancellation is not an error: a cancelled chat simply ends.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::GatewayState;
use crate::upstream::{TransportFailure, UpstreamError};

/// Errors returned by [`Gateway`](crate::Gateway) operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The upstream channel failed (refused, unreachable, dropped).
    #[error("upstream transport error ({kind}): {message}")]
    Transport {
        /// What kind of link failure occurred.
        kind: TransportFailure,
        /// Detail from the transport.
        message: String,
    },

    /// A channel-level operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The models could not be made ready.
    #[error(transparent)]
    Ready(#[from] ReadyError),

    /// A single chat call failed before it started streaming.
    #[error(transparent)]
    Call(#[from] ChatError),

    /// The upstream answered a request with an error object.
    #[error("upstream error {code}: {message}")]
    Remote {
        /// Error code reported by the upstream.
        code: i32,
        /// Error message reported by the upstream.
        message: String,
    },

    /// The concurrency limit and the wait queue are both full.
    #[error("gateway busy: {in_flight} chat streams active and {queued} waiting")]
    Busy {
        /// Streams currently holding a slot.
        in_flight: usize,
        /// Callers currently waiting for a slot.
        queued: usize,
    },

    /// The gateway is degraded; a reconnect is required before new work.
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// No upstream connection has been established.
    #[error("not connected to the upstream service")]
    NotConnected,

    /// A state change outside the allowed transition table was attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// State before the attempted transition.
        from: GatewayState,
        /// Requested target state.
        to: GatewayState,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl GatewayError {
    /// Whether this error means the upstream channel is unusable.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Transport { kind, message } => Self::Transport { kind, message },
            UpstreamError::Timeout(what) => Self::Timeout(what),
            UpstreamError::Remote { code, message } => Self::Remote { code, message },
            UpstreamError::Protocol(message) => Self::Call(ChatError::new(
                ErrorCategory::Protocol,
                message,
            )),
        }
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Why a readiness attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadyFailure {
    /// The upstream answered the load request with `status: false`.
    Rejected,
    /// The upstream answered the load request with an error object.
    Remote,
    /// The load did not finish within the load timeout.
    Timeout,
    /// The channel failed during the probe or the load.
    Transport,
    /// The middleware layer did not answer its liveness probe.
    MiddlewareDown,
    /// The gateway was disconnected or reconnected while the load ran.
    Interrupted,
}

impl fmt::Display for ReadyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected => write!(f, "rejected"),
            Self::Remote => write!(f, "remote"),
            Self::Timeout => write!(f, "timeout"),
            Self::Transport => write!(f, "transport"),
            Self::MiddlewareDown => write!(f, "middleware_down"),
            Self::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// A failed attempt to bring the models to the ready state.
///
/// Cloned to every caller attached to the same load.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("models not ready ({kind}): {reason}")]
pub struct ReadyError {
    /// Failure class.
    pub kind: ReadyFailure,
    /// Human-readable reason.
    pub reason: String,
}

impl ReadyError {
    /// Create a readiness error.
    #[must_use]
    pub fn new(kind: ReadyFailure, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Category carried by a failed chat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The channel dropped mid-call.
    Transport,
    /// No chunk arrived within the chunk timeout.
    Timeout,
    /// The upstream reported an error for this call.
    Remote,
    /// The upstream sent something that could not be decoded.
    Protocol,
    /// The gateway aborted the call (disconnect, reload, transport fault elsewhere).
    Aborted,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport => write!(f, "transport"),
            Self::Timeout => write!(f, "timeout"),
            Self::Remote => write!(f, "remote"),
            Self::Protocol => write!(f, "protocol"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Terminal error item of a chat stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chat {category} error: {message}")]
pub struct ChatError {
    /// Failure category.
    pub category: ErrorCategory,
    /// Detail message.
    pub message: String,
}

impl ChatError {
    /// Create a chat error.
    #[must_use]
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// Classify an upstream error for a single call.
    #[must_use]
    pub fn from_upstream(err: &UpstreamError) -> Self {
        let category = match err {
            UpstreamError::Transport { .. } => ErrorCategory::Transport,
            UpstreamError::Timeout(_) => ErrorCategory::Timeout,
            UpstreamError::Remote { .. } => ErrorCategory::Remote,
            UpstreamError::Protocol(_) => ErrorCategory::Protocol,
        };
        Self::new(category, err.to_string())
    }
}
