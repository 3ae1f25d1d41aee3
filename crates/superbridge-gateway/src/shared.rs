//! State shared by the gateway components.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::GatewayConfig;
use crate::error::{ChatError, ErrorCategory};
use crate::health::{CallFailure, HealthMonitor};
use crate::proxy::{ChatStreamProxy, InFlightRegistry};
use crate::readiness::ReadinessGate;
use crate::session::SessionId;
use crate::state::{GatewayState, StateMachine};
use crate::transport::TransportChannel;
use crate::upstream::Connector;

/// Everything the controller, the readiness gate and the chat relays touch.
///
/// `epoch` increases whenever the channel is opened or dropped; work started
/// against an older channel checks it before touching gateway state.
pub(crate) struct GatewayShared {
    pub(crate) state: StateMachine,
    pub(crate) channel: TransportChannel,
    pub(crate) monitor: HealthMonitor,
    pub(crate) readiness: ReadinessGate,
    pub(crate) calls: InFlightRegistry,
    pub(crate) proxy: ChatStreamProxy,
    pub(crate) config: GatewayConfig,
    epoch: AtomicU64,
    last_call_error: Mutex<Option<CallFailure>>,
}

impl GatewayShared {
    pub(crate) fn new(config: GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            state: StateMachine::new(),
            channel: TransportChannel::new(
                connector,
                config.upstream.target(),
                config.timeouts.disconnect(),
            ),
            monitor: HealthMonitor::new(
                config.upstream.client_name.clone(),
                config.timeouts.probe(),
            ),
            readiness: ReadinessGate::default(),
            calls: InFlightRegistry::default(),
            proxy: ChatStreamProxy::new(&config.chat, &config.timeouts),
            config,
            epoch: AtomicU64::new(0),
            last_call_error: Mutex::new(None),
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn advance_epoch(&self) -> u64 {
        self.epoch
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1)
    }

    /// The channel opened at `epoch` is unusable: degrade and abort every call.
    pub(crate) fn transport_fault(&self, epoch: u64, reason: &str) {
        // Checked under the state lock so a reconnect cannot slip in between.
        let outcome = self
            .state
            .transition_if(GatewayState::Degraded, reason, || epoch == self.epoch());
        match outcome {
            None => {
                debug!(epoch, reason, "Ignoring fault from a replaced channel");
                return;
            },
            Some(Ok(GatewayState::Degraded) | Err(_)) => {},
            Some(Ok(previous)) => {
                warn!(from = %previous, reason, "Upstream channel fault, gateway degraded");
            },
        }

        self.calls.abort_all(&ChatError::new(
            ErrorCategory::Transport,
            format!("upstream channel failed: {reason}"),
        ));
    }

    pub(crate) fn record_call_failure(&self, session_id: SessionId, err: &ChatError) {
        let failure = CallFailure {
            session_id: session_id.get(),
            category: err.category,
            message: err.message.clone(),
            at: Utc::now(),
        };
        *self
            .last_call_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(failure);
    }

    pub(crate) fn last_call_error(&self) -> Option<CallFailure> {
        self.last_call_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
