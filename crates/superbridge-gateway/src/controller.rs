//! Gateway controller.
//!
//! [`Gateway`] is the one process-wide owner of the upstream link. It drives
//! the transport channel, the health monitor, the readiness gate and the chat
//! proxy, and is the only place that opens or closes the channel.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::error::{ChatError, ErrorCategory, GatewayError, GatewayResult};
use crate::health::{HealthReport, HealthSnapshot};
use crate::proxy::{ChatStream, InFlightCall};
use crate::readiness;
use crate::session::{ChatSession, SessionId};
use crate::shared::GatewayShared;
use crate::state::{GatewayState, Transition};
use crate::upstream::{Connector, SessionSummary, UpstreamChannel, UpstreamError, WsConnector};

/// Outcome of [`Gateway::reconnect`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectReport {
    /// Always `connected`; a failed reopen is returned as an error instead.
    pub status: String,
    /// Whether the re-run readiness check left the models loaded.
    pub models_loaded: bool,
    /// Human-readable summary.
    pub message: String,
}

/// Handle to the upstream gateway. Cheap to clone; all clones share one link.
#[derive(Clone)]
pub struct Gateway {
    shared: Arc<GatewayShared>,
    /// Serializes connect, disconnect and reconnect.
    ops: Arc<Mutex<()>>,
}

impl Gateway {
    /// Create a disconnected gateway using `connector` to open links.
    #[must_use]
    pub fn new(config: GatewayConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(GatewayShared::new(config, connector)),
            ops: Arc::new(Mutex::new(())),
        }
    }

    /// Create a disconnected gateway speaking JSON-RPC over WebSocket.
    #[must_use]
    pub fn with_websocket(config: GatewayConfig) -> Self {
        let connector = Arc::new(WsConnector::new(config.timeouts.longest_request()));
        Self::new(config, connector)
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    /// Current state. Lock-free.
    #[must_use]
    pub fn state(&self) -> GatewayState {
        self.shared.state.current()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<GatewayState> {
        self.shared.state.subscribe()
    }

    /// Recent state transitions, oldest first.
    #[must_use]
    pub fn transitions(&self) -> Vec<Transition> {
        self.shared.state.history()
    }

    /// Active chat calls.
    #[must_use]
    pub fn in_flight(&self) -> Vec<InFlightCall> {
        self.shared.calls.snapshot()
    }

    /// Chat callers waiting for a concurrency slot.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.proxy.queued()
    }

    /// Number of upstream model loads issued since startup.
    #[must_use]
    pub fn load_attempts(&self) -> u64 {
        self.shared.readiness.loads_started()
    }

    /// Open the upstream channel.
    ///
    /// A no-op when a channel is already open.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unavailable`] while degraded (use
    /// [`Gateway::reconnect`]) and a transport error if the channel cannot be
    /// opened, in which case the gateway is left `Degraded`.
    pub async fn connect(&self) -> GatewayResult<()> {
        let _ops = self.ops.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> GatewayResult<()> {
        match self.state() {
            GatewayState::Connected | GatewayState::LoadingModels | GatewayState::Ready => {
                return Ok(());
            },
            GatewayState::Degraded => {
                return Err(GatewayError::Unavailable(
                    "upstream channel degraded; reconnect required".into(),
                ));
            },
            GatewayState::Disconnected | GatewayState::Connecting => {},
        }
        self.open_locked().await
    }

    async fn open_locked(&self) -> GatewayResult<()> {
        let target = self.shared.channel.target().clone();
        // The epoch moves before the state so a stale fault cannot land on Connecting.
        self.shared.advance_epoch();
        self.shared
            .state
            .transition(GatewayState::Connecting, "connect requested")?;
        info!(target = %target, "Connecting to upstream");

        match self
            .shared
            .channel
            .open(self.shared.config.timeouts.connect())
            .await
        {
            Ok(_) => {
                self.shared
                    .state
                    .transition(GatewayState::Connected, "channel opened")?;
                Ok(())
            },
            Err(e) => {
                warn!(target = %target, error = %e, "Failed to connect to upstream");
                let _ = self
                    .shared
                    .state
                    .transition(GatewayState::Degraded, &e.to_string());
                Err(e.into())
            },
        }
    }

    /// Abort every chat call, say goodbye to the upstream and close the channel.
    pub async fn disconnect(&self) {
        let _ops = self.ops.lock().await;
        self.teardown("disconnect requested", GatewayState::Disconnected)
            .await;
    }

    /// Abort calls and close the channel, leaving the state at `settle`.
    async fn teardown(&self, reason: &str, settle: GatewayState) {
        // Moving the epoch first makes late faults from the old channel no-ops.
        self.shared.advance_epoch();
        let aborted = self.shared.calls.abort_all(&ChatError::new(
            ErrorCategory::Aborted,
            format!("gateway disconnecting: {reason}"),
        ));
        let _ = self.shared.state.transition(settle, reason);
        self.shared.readiness.reset();
        self.shared.channel.close_gracefully().await;
        info!(aborted, reason, "Upstream disconnected");
    }

    /// Drop whatever link exists and rebuild state from scratch.
    ///
    /// Safe to call in any state, including `Degraded`. After the channel is
    /// reopened, readiness is re-derived through [`Gateway::ensure_ready`].
    ///
    /// # Errors
    ///
    /// Returns an error only if the channel cannot be reopened. A readiness
    /// failure is reported in [`ReconnectReport::models_loaded`].
    pub async fn reconnect(&self) -> GatewayResult<ReconnectReport> {
        {
            let _ops = self.ops.lock().await;
            let from = self.state();
            info!(state = %from, "Reconnecting to upstream");
            // Degraded reopens directly; any other state passes through Disconnected.
            let settle = if from == GatewayState::Degraded {
                GatewayState::Degraded
            } else {
                GatewayState::Disconnected
            };
            self.teardown("reconnect requested", settle).await;
            self.open_locked().await?;
        }

        match readiness::ensure_ready(&self.shared).await {
            Ok(()) => Ok(ReconnectReport {
                status: "connected".into(),
                models_loaded: true,
                message: "Reconnected successfully".into(),
            }),
            Err(e) => {
                warn!(error = %e, "Reconnected but models are not ready");
                Ok(ReconnectReport {
                    status: "connected".into(),
                    models_loaded: false,
                    message: format!("Connected, but models failed to load: {e}"),
                })
            },
        }
    }

    /// Probe the upstream and report. Never fails.
    pub async fn health(&self) -> HealthReport {
        let state = self.state();
        let handle = match state {
            GatewayState::Disconnected | GatewayState::Connecting => None,
            _ => self.shared.channel.current(),
        };

        let snapshot = match handle {
            None => HealthSnapshot::disconnected(),
            Some(handle) => {
                let epoch = self.shared.epoch();
                let outcome = self.shared.monitor.probe_detailed(handle.as_ref()).await;
                if let Some(fault) = outcome.channel_fault {
                    self.shared.transport_fault(epoch, &fault.to_string());
                }
                self.shared.state.observe(outcome.snapshot.clone());
                outcome.snapshot
            },
        };

        HealthReport::new(
            snapshot,
            self.state(),
            self.shared.calls.len(),
            self.shared.last_call_error(),
        )
    }

    /// Make sure the models are loaded, connecting first if needed.
    ///
    /// Concurrent callers share one upstream load and all see its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Unavailable`] while degraded, a connect error on
    /// first use, or [`GatewayError::Ready`] when the load fails.
    pub async fn ensure_ready(&self) -> GatewayResult<()> {
        if matches!(
            self.state(),
            GatewayState::Disconnected | GatewayState::Connecting
        ) {
            self.connect().await?;
        }
        readiness::ensure_ready(&self.shared).await
    }

    /// Start a chat call.
    ///
    /// The returned stream yields text chunks in upstream order. Cancelling
    /// `cancel`, calling [`ChatStream::cancel`] or dropping the stream stops the
    /// upstream call; a call cancelled before it starts returns an empty stream.
    ///
    /// # Errors
    ///
    /// Fails before any chunk is produced when the gateway is degraded, the
    /// models cannot be made ready, the proxy is full, or the upstream stream
    /// cannot be opened. Failures after that arrive as the stream's last item.
    pub async fn chat(
        &self,
        session: ChatSession,
        prompt: impl Into<String>,
        cancel: CancellationToken,
    ) -> GatewayResult<ChatStream> {
        let session_id = session.session_id;
        if cancel.is_cancelled() {
            return Ok(ChatStream::finished(session_id));
        }
        if self.state() == GatewayState::Degraded {
            return Err(GatewayError::Unavailable(
                "upstream channel degraded; reconnect required".into(),
            ));
        }

        if !self.ready_or_cancelled(&cancel).await? {
            return Ok(ChatStream::finished(session_id));
        }

        let Some(permit) = self.shared.proxy.acquire(&cancel).await? else {
            debug!(session_id = %session_id, "Chat cancelled while queued");
            return Ok(ChatStream::finished(session_id));
        };

        // The state may have moved while this call was queued.
        if !self.ready_or_cancelled(&cancel).await? {
            return Ok(ChatStream::finished(session_id));
        }

        let epoch = self.shared.epoch();
        let handle = self
            .shared
            .channel
            .current()
            .ok_or(GatewayError::NotConnected)?;

        debug!(session_id = %session_id, "Starting chat");
        self.shared
            .proxy
            .start(
                &self.shared,
                handle,
                epoch,
                session,
                prompt.into(),
                cancel,
                permit,
            )
            .await
    }

    /// Returns `false` if `cancel` fired first.
    async fn ready_or_cancelled(&self, cancel: &CancellationToken) -> GatewayResult<bool> {
        if self.state() == GatewayState::Ready {
            return Ok(true);
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(false),
            ready = self.ensure_ready() => ready.map(|()| true),
        }
    }

    /// Chat sessions known to the upstream.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotConnected`] without a channel, or the upstream
    /// failure. A channel-level failure degrades the gateway.
    pub async fn chat_history(&self) -> GatewayResult<Vec<SessionSummary>> {
        self.session_call("chat history", |handle| async move {
            handle.chat_history().await
        })
        .await
    }

    /// Ask the upstream to forget a session.
    ///
    /// # Errors
    ///
    /// Same as [`Gateway::chat_history`].
    pub async fn remove_session(&self, session_id: SessionId) -> GatewayResult<bool> {
        self.session_call("remove session", move |handle| async move {
            handle.remove_session(session_id).await
        })
        .await
    }

    /// Pick a fresh 8-digit session id not present in the upstream history.
    pub async fn allocate_session_id(&self) -> SessionId {
        match self.chat_history().await {
            Ok(history) => {
                let taken: HashSet<i64> = history.iter().map(|s| s.sid).collect();
                SessionId::random_excluding(&taken)
            },
            Err(e) => {
                debug!(error = %e, "Chat history unavailable, allocating blind session id");
                SessionId::random()
            },
        }
    }

    async fn session_call<T, F, Fut>(&self, what: &str, call: F) -> GatewayResult<T>
    where
        F: FnOnce(Arc<dyn UpstreamChannel>) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        if !self.state().has_channel() {
            return Err(GatewayError::NotConnected);
        }
        let epoch = self.shared.epoch();
        let handle = self
            .shared
            .channel
            .current()
            .ok_or(GatewayError::NotConnected)?;

        let timeout = self.shared.config.timeouts.request();
        match tokio::time::timeout(timeout, call(handle)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_channel_fault() {
                    self.shared.transport_fault(epoch, &e.to_string());
                }
                Err(e.into())
            },
            Err(_) => Err(GatewayError::Timeout(format!(
                "{what} took longer than {timeout:?}"
            ))),
        }
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("state", &self.state())
            .field("target", self.shared.channel.target())
            .field("in_flight", &self.shared.calls.len())
            .finish_non_exhaustive()
    }
}
