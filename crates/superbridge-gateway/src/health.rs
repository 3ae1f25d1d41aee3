//! Health probes for the upstream service.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ErrorCategory;
use crate::state::GatewayState;
use crate::upstream::{
    MODELS_READY_ACK, TransportFailure, UpstreamChannel, UpstreamError, UpstreamResult,
};

/// Message for a fully healthy upstream.
pub const MSG_OPERATIONAL: &str = "All systems operational";
/// Message when the middleware answers but the models are not loaded.
pub const MSG_MODELS_NOT_LOADED: &str = "Models not loaded";
/// Message when no channel is open.
pub const MSG_NOT_CONNECTED: &str = "Not connected to Super Builder service";

/// Overall health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Middleware up and models ready.
    Healthy,
    /// Anything less.
    Degraded,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// Result of one probe round. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// The middleware answered its greeting.
    pub middleware_up: bool,
    /// The model runtime reported ready. Always false when the middleware is down.
    pub models_ready: bool,
    /// Human-readable summary.
    pub message: String,
    /// When the probes ran.
    pub observed_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Build a snapshot from raw probe results.
    #[must_use]
    pub fn from_probes(middleware_up: bool, models_ready: bool) -> Self {
        let models_ready = middleware_up && models_ready;
        let message = if models_ready {
            MSG_OPERATIONAL
        } else if middleware_up {
            MSG_MODELS_NOT_LOADED
        } else {
            "Middleware not responding"
        };
        Self::with_message(middleware_up, models_ready, message)
    }

    /// Snapshot reported when there is no channel to probe.
    #[must_use]
    pub fn disconnected() -> Self {
        Self::with_message(false, false, MSG_NOT_CONNECTED)
    }

    fn with_message(middleware_up: bool, models_ready: bool, message: impl Into<String>) -> Self {
        Self {
            middleware_up,
            models_ready: middleware_up && models_ready,
            message: message.into(),
            observed_at: Utc::now(),
        }
    }

    /// Reduce to the two-valued health state.
    #[must_use]
    pub fn state(&self) -> HealthState {
        if self.models_ready {
            HealthState::Healthy
        } else {
            HealthState::Degraded
        }
    }
}

/// Probe result plus any channel-level fault seen while probing.
#[derive(Debug, Clone)]
pub(crate) struct ProbeOutcome {
    pub(crate) snapshot: HealthSnapshot,
    pub(crate) channel_fault: Option<UpstreamError>,
}

/// Issues the two liveness probes and combines them.
#[derive(Debug, Clone)]
pub struct HealthMonitor {
    client_label: String,
    probe_timeout: Duration,
}

impl HealthMonitor {
    /// Create a monitor greeting the upstream as `client_label`.
    #[must_use]
    pub fn new(client_label: impl Into<String>, probe_timeout: Duration) -> Self {
        Self {
            client_label: client_label.into(),
            probe_timeout,
        }
    }

    /// Probe both upstream layers. Never fails; problems show up in the snapshot.
    pub async fn probe(&self, handle: &dyn UpstreamChannel) -> HealthSnapshot {
        self.probe_detailed(handle).await.snapshot
    }

    pub(crate) async fn probe_detailed(&self, handle: &dyn UpstreamChannel) -> ProbeOutcome {
        if !handle.is_alive() {
            return ProbeOutcome {
                snapshot: HealthSnapshot::with_message(false, false, "Upstream connection closed"),
                channel_fault: Some(UpstreamError::transport(
                    TransportFailure::Closed,
                    "channel no longer connected",
                )),
            };
        }

        let hello = tokio::time::timeout(self.probe_timeout, handle.say_hello(&self.client_label))
            .await;
        let middleware_up = match classify("middleware", hello) {
            Ok(reply) => !reply.is_empty(),
            Err(err) => return Self::failed(err),
        };
        if !middleware_up {
            return ProbeOutcome {
                snapshot: HealthSnapshot::from_probes(false, false),
                channel_fault: None,
            };
        }

        let hello_llm =
            tokio::time::timeout(self.probe_timeout, handle.say_hello_llm(&self.client_label))
                .await;
        let models_ready = match classify("model runtime", hello_llm) {
            Ok(reply) => reply == MODELS_READY_ACK,
            Err(ProbeError::TimedOut(_)) => false,
            Err(ProbeError::Failed(err)) if !err.is_channel_fault() => {
                debug!(error = %err, "Model runtime probe failed");
                false
            },
            Err(err) => return Self::failed(err),
        };

        ProbeOutcome {
            snapshot: HealthSnapshot::from_probes(true, models_ready),
            channel_fault: None,
        }
    }

    fn failed(err: ProbeError) -> ProbeOutcome {
        match err {
            ProbeError::TimedOut(layer) => ProbeOutcome {
                snapshot: HealthSnapshot::with_message(
                    false,
                    false,
                    format!("{layer} probe timed out"),
                ),
                channel_fault: None,
            },
            ProbeError::Failed(err) => ProbeOutcome {
                snapshot: HealthSnapshot::with_message(
                    false,
                    false,
                    format!("Health check error: {err}"),
                ),
                channel_fault: err.is_channel_fault().then_some(err),
            },
        }
    }
}

enum ProbeError {
    TimedOut(&'static str),
    Failed(UpstreamError),
}

fn classify(
    layer: &'static str,
    result: Result<UpstreamResult<String>, tokio::time::error::Elapsed>,
) -> Result<String, ProbeError> {
    match result {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(err)) => Err(ProbeError::Failed(err)),
        Err(_) => {
            debug!(layer, "Health probe timed out");
            Err(ProbeError::TimedOut(layer))
        },
    }
}

/// Most recent chat failure, exposed as a side channel on the health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFailure {
    /// Session of the failed call.
    pub session_id: i64,
    /// Failure category.
    pub category: ErrorCategory,
    /// Detail message.
    pub message: String,
    /// When the call failed.
    pub at: DateTime<Utc>,
}

/// Health as reported to collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// `healthy` iff the models are ready.
    pub status: HealthState,
    /// Middleware probe result.
    pub middleware_connected: bool,
    /// Model runtime probe result.
    pub models_ready: bool,
    /// Human-readable summary.
    pub message: String,
    /// Gateway state after the probe was applied.
    pub state: GatewayState,
    /// Number of chat streams in flight.
    pub in_flight: usize,
    /// When the probes ran.
    pub observed_at: DateTime<Utc>,
    /// Most recent chat failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_call_error: Option<CallFailure>,
}

impl HealthReport {
    /// Assemble a report.
    #[must_use]
    pub fn new(
        snapshot: HealthSnapshot,
        state: GatewayState,
        in_flight: usize,
        last_call_error: Option<CallFailure>,
    ) -> Self {
        Self {
            status: snapshot.state(),
            middleware_connected: snapshot.middleware_up,
            models_ready: snapshot.models_ready,
            message: snapshot.message,
            state,
            in_flight,
            observed_at: snapshot.observed_at,
            last_call_error,
        }
    }

    /// Whether the upstream is fully usable.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}
