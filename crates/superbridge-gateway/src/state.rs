//! Gateway connection state machine.
//!
//! There is one [`StateMachine`] per gateway. Transitions are serialized by an
//! internal lock and validated against [`GatewayState::can_transition_to`];
//! readers take lock-free snapshots through a `watch` channel.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::health::HealthSnapshot;

const HISTORY_LIMIT: usize = 64;

/// Connection and readiness state of the upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    /// No channel open.
    Disconnected,
    /// Opening the channel.
    Connecting,
    /// Channel open, models not known to be loaded.
    Connected,
    /// A model load is running.
    LoadingModels,
    /// Channel open and models loaded.
    Ready,
    /// The channel failed; a reconnect is required.
    Degraded,
}

impl GatewayState {
    /// Whether `self -> to` is an edge of the transition table.
    ///
    /// Self transitions are handled by [`StateMachine::transition`] as no-ops
    /// and are not edges.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use GatewayState::{Connected, Connecting, Degraded, Disconnected, LoadingModels, Ready};

        matches!(
            (self, to),
            (Disconnected | Degraded, Connecting)
                | (Connecting, Connected | Degraded | Disconnected)
                | (Connected, LoadingModels | Ready | Degraded | Disconnected)
                | (LoadingModels, Ready | Connected | Degraded | Disconnected)
                | (Ready, Connected | Degraded | Disconnected)
                | (Degraded, Disconnected)
        )
    }

    /// Whether chat calls may be in flight in this state.
    #[must_use]
    pub fn accepts_calls(self) -> bool {
        matches!(self, Self::Connected | Self::Ready)
    }

    /// Whether an upstream channel is expected to be open.
    #[must_use]
    pub fn has_channel(self) -> bool {
        matches!(self, Self::Connected | Self::LoadingModels | Self::Ready)
    }

    /// All states, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Disconnected,
        Self::Connecting,
        Self::Connected,
        Self::LoadingModels,
        Self::Ready,
        Self::Degraded,
    ];
}

impl fmt::Display for GatewayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::LoadingModels => write!(f, "loading_models"),
            Self::Ready => write!(f, "ready"),
            Self::Degraded => write!(f, "degraded"),
        }
    }
}

/// One recorded state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Previous state.
    pub from: GatewayState,
    /// New state.
    pub to: GatewayState,
    /// Why the change happened.
    pub reason: String,
    /// When it happened.
    pub at: DateTime<Utc>,
}

struct Inner {
    history: VecDeque<Transition>,
    last_snapshot: Option<HealthSnapshot>,
}

/// Owner of the single [`GatewayState`] value.
pub struct StateMachine {
    tx: watch::Sender<GatewayState>,
    inner: Mutex<Inner>,
}

impl StateMachine {
    /// Create a machine in [`GatewayState::Disconnected`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(GatewayState::Disconnected);
        Self {
            tx,
            inner: Mutex::new(Inner {
                history: VecDeque::with_capacity(HISTORY_LIMIT),
                last_snapshot: None,
            }),
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> GatewayState {
        *self.tx.borrow()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<GatewayState> {
        self.tx.subscribe()
    }

    /// Move to `to`, returning the previous state.
    ///
    /// A transition to the current state is a no-op. Entering `Ready` also
    /// requires the last recorded health snapshot to report loaded models.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidTransition`] when the edge is not in the
    /// table or the readiness requirement is not met; the state is unchanged.
    pub fn transition(&self, to: GatewayState, reason: &str) -> GatewayResult<GatewayState> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.transition_locked(&mut inner, to, reason)
    }

    /// Move to `to` only if `still_valid` holds while the state lock is held.
    ///
    /// Returns `None` without touching the state when `still_valid` is false.
    pub(crate) fn transition_if(
        &self,
        to: GatewayState,
        reason: &str,
        still_valid: impl FnOnce() -> bool,
    ) -> Option<GatewayResult<GatewayState>> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if !still_valid() {
            return None;
        }
        Some(self.transition_locked(&mut inner, to, reason))
    }

    /// Record the latest health snapshot, replacing the previous one.
    ///
    /// A snapshot without loaded models demotes `Ready` to `Connected` under the
    /// same lock, so `Ready` never coexists with a not-ready snapshot. Returns
    /// the state after the snapshot was applied.
    pub fn observe(&self, snapshot: HealthSnapshot) -> GatewayState {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let demote = !snapshot.models_ready && self.current() == GatewayState::Ready;
        inner.last_snapshot = Some(snapshot);
        if demote {
            // Ready -> Connected is always an edge.
            let _ = self.transition_locked(
                &mut inner,
                GatewayState::Connected,
                "probe reported models not ready",
            );
        }
        self.current()
    }

    fn transition_locked(
        &self,
        inner: &mut Inner,
        to: GatewayState,
        reason: &str,
    ) -> GatewayResult<GatewayState> {
        let from = self.current();

        if from == to {
            return Ok(from);
        }

        let models_ready = inner.last_snapshot.as_ref().is_some_and(|s| s.models_ready);
        if !from.can_transition_to(to) || (to == GatewayState::Ready && !models_ready) {
            warn!(from = %from, to = %to, reason, "Rejected gateway state transition");
            return Err(GatewayError::InvalidTransition { from, to });
        }

        self.tx.send_replace(to);

        if inner.history.len() >= HISTORY_LIMIT {
            inner.history.pop_front();
        }
        inner.history.push_back(Transition {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });

        info!(from = %from, to = %to, reason, "Gateway state transition");
        Ok(from)
    }

    /// The last recorded health snapshot.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<HealthSnapshot> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_snapshot
            .clone()
    }

    /// Recent transitions, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<Transition> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.current())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use GatewayState::*;

    fn ready_snapshot() -> HealthSnapshot {
        HealthSnapshot::from_probes(true, true)
    }

    #[test]
    fn table_edges() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Degraded.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(LoadingModels));
        assert!(LoadingModels.can_transition_to(Ready));
        assert!(LoadingModels.can_transition_to(Degraded));
        assert!(Ready.can_transition_to(Degraded));

        assert!(!Disconnected.can_transition_to(Ready));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Degraded.can_transition_to(Ready));
        assert!(!Degraded.can_transition_to(Connected));
        assert!(!Ready.can_transition_to(LoadingModels));
        assert!(!Connecting.can_transition_to(Ready));
    }

    #[test]
    fn no_self_edges() {
        for state in GatewayState::ALL {
            assert!(!state.can_transition_to(state), "{state}");
        }
    }

    #[test]
    fn every_state_can_reach_disconnected_except_itself() {
        for state in GatewayState::ALL {
            if state != Disconnected {
                assert!(state.can_transition_to(Disconnected), "{state}");
            }
        }
    }

    #[test]
    fn transition_if_checks_guard_under_lock() {
        let machine = StateMachine::new();

        assert!(machine.transition_if(Connecting, "stale", || false).is_none());
        assert_eq!(machine.current(), Disconnected);

        let moved = machine.transition_if(Connecting, "connect", || {
            machine.inner.try_lock().is_err()
        });
        assert_eq!(moved.unwrap().unwrap(), Disconnected);
        assert_eq!(machine.current(), Connecting);
    }

    #[test]
    fn invalid_transition_leaves_state() {
        let machine = StateMachine::new();
        let err = machine.transition(Ready, "skip ahead").unwrap_err();
        assert!(matches!(
            err,
            GatewayError::InvalidTransition {
                from: Disconnected,
                to: Ready
            }
        ));
        assert_eq!(machine.current(), Disconnected);
        assert!(machine.history().is_empty());
    }

    #[test]
    fn ready_requires_models_ready_snapshot() {
        let machine = StateMachine::new();
        machine.transition(Connecting, "connect").unwrap();
        machine.transition(Connected, "open").unwrap();

        machine.observe(HealthSnapshot::from_probes(true, false));
        assert!(machine.transition(Ready, "probe").is_err());

        machine.observe(ready_snapshot());
        assert_eq!(machine.transition(Ready, "probe").unwrap(), Connected);
        assert_eq!(machine.current(), Ready);
    }

    #[test]
    fn not_ready_snapshot_demotes_ready() {
        let machine = StateMachine::new();
        machine.transition(Connecting, "connect").unwrap();
        machine.transition(Connected, "open").unwrap();
        machine.observe(ready_snapshot());
        machine.transition(Ready, "probe").unwrap();

        let after = machine.observe(HealthSnapshot::from_probes(false, false));
        assert_eq!(after, Connected);
        assert!(!machine.last_snapshot().unwrap().models_ready);
    }

    #[test]
    fn self_transition_is_noop() {
        let machine = StateMachine::new();
        assert_eq!(machine.transition(Disconnected, "again").unwrap(), Disconnected);
        assert!(machine.history().is_empty());
    }

    #[test]
    fn history_is_bounded() {
        let machine = StateMachine::new();
        for _ in 0..HISTORY_LIMIT {
            machine.transition(Connecting, "up").unwrap();
            machine.transition(Disconnected, "down").unwrap();
        }
        let history = machine.history();
        assert_eq!(history.len(), HISTORY_LIMIT);
        assert_eq!(history.last().unwrap().to, Disconnected);
    }

    #[tokio::test]
    async fn subscribers_see_changes() {
        let machine = StateMachine::new();
        let mut rx = machine.subscribe();
        machine.transition(Connecting, "connect").unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Connecting);
    }
}
