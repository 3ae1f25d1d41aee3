//! Single-flight model readiness.
//!
//! Loading models is slow and stateful on the upstream side, so concurrent
//! demand collapses into one load: the first caller installs a shared future
//! in the gate's slot and every later caller awaits that same future. The slot
//! is cleared when the load finishes, whatever the outcome, so a failed load
//! never poisons the gate. A caller whose probe overlapped a load that has
//! since finished takes that load's outcome rather than starting another.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tracing::{debug, info, warn};

use crate::error::{
    ChatError, ErrorCategory, GatewayError, GatewayResult, ReadyError, ReadyFailure,
};
use crate::health::HealthSnapshot;
use crate::shared::GatewayShared;
use crate::state::GatewayState;
use crate::upstream::UpstreamChannel;

type LoadFuture = Shared<BoxFuture<'static, Result<(), ReadyError>>>;

struct PendingLoad {
    epoch: u64,
    future: LoadFuture,
}

struct FinishedLoad {
    epoch: u64,
    result: Result<(), ReadyError>,
}

#[derive(Default)]
struct Slot {
    pending: Option<PendingLoad>,
    last: Option<FinishedLoad>,
    finished: u64,
}

/// The load token: at most one pending load per channel.
#[derive(Default)]
pub(crate) struct ReadinessGate {
    slot: Mutex<Slot>,
    loads_started: AtomicU64,
}

impl ReadinessGate {
    /// The load in flight on `epoch`, plus how many loads had finished so far.
    fn pending(&self, epoch: u64) -> (Option<LoadFuture>, u64) {
        let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = slot
            .pending
            .as_ref()
            .filter(|p| p.epoch == epoch)
            .map(|p| p.future.clone());
        (pending, slot.finished)
    }

    fn finish(&self, epoch: u64, result: &Result<(), ReadyError>) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.pending.as_ref().is_some_and(|p| p.epoch == epoch) {
            slot.pending = None;
        }
        slot.last = Some(FinishedLoad {
            epoch,
            result: result.clone(),
        });
        slot.finished = slot.finished.wrapping_add(1);
    }

    /// Forget any pending load. Its waiters still get its result.
    pub(crate) fn reset(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .take();
    }

    /// Number of upstream loads issued so far.
    pub(crate) fn loads_started(&self) -> u64 {
        self.loads_started.load(Ordering::Acquire)
    }
}

/// Make sure the models are loaded on the current channel.
///
/// Probes first; loads only if the probe says the models are not ready, and
/// joins an in-flight load instead of starting a second one.
pub(crate) async fn ensure_ready(shared: &Arc<GatewayShared>) -> GatewayResult<()> {
    match shared.state.current() {
        GatewayState::Degraded => {
            return Err(GatewayError::Unavailable(
                "upstream channel degraded; reconnect required".into(),
            ));
        },
        GatewayState::Disconnected | GatewayState::Connecting => {
            return Err(GatewayError::NotConnected);
        },
        GatewayState::Connected | GatewayState::LoadingModels | GatewayState::Ready => {},
    }

    let epoch = shared.epoch();
    let (pending, seen) = shared.readiness.pending(epoch);
    if let Some(pending) = pending {
        debug!("Joining in-flight model load");
        return pending.await.map_err(GatewayError::from);
    }

    let handle = shared.channel.current().ok_or(GatewayError::NotConnected)?;
    let outcome = shared.monitor.probe_detailed(handle.as_ref()).await;
    if let Some(fault) = outcome.channel_fault {
        shared.transport_fault(epoch, &fault.to_string());
        return Err(ReadyError::new(ReadyFailure::Transport, fault.to_string()).into());
    }

    let snapshot = outcome.snapshot;
    shared.state.observe(snapshot.clone());
    if snapshot.models_ready {
        shared
            .state
            .transition(GatewayState::Ready, "probe reported models ready")?;
        return Ok(());
    }
    if !snapshot.middleware_up {
        return Err(ReadyError::new(ReadyFailure::MiddlewareDown, snapshot.message).into());
    }

    let future = {
        let mut slot = shared
            .readiness
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // A load on this channel finished while we were probing.
        let adopted = slot
            .last
            .as_ref()
            .filter(|last| slot.finished != seen && last.epoch == epoch)
            .map(|last| last.result.clone());
        let joined = slot
            .pending
            .as_ref()
            .filter(|pending| pending.epoch == epoch)
            .map(|pending| pending.future.clone());
        match (joined, adopted) {
            (Some(future), _) => future,
            (None, Some(result)) => {
                debug!("Adopting outcome of a load that finished during the probe");
                return result.map_err(GatewayError::from);
            },
            _ if shared.state.current() == GatewayState::Ready => return Ok(()),
            _ => {
                shared
                    .state
                    .transition(GatewayState::LoadingModels, "models not loaded")?;
                shared.calls.abort_all(&ChatError::new(
                    ErrorCategory::Aborted,
                    "models are being reloaded",
                ));
                let future = start_load(Arc::clone(shared), handle, epoch);
                slot.pending = Some(PendingLoad {
                    epoch,
                    future: future.clone(),
                });
                future
            },
        }
    };

    future.await.map_err(GatewayError::from)
}

fn start_load(
    shared: Arc<GatewayShared>,
    handle: Arc<dyn UpstreamChannel>,
    epoch: u64,
) -> LoadFuture {
    shared.readiness.loads_started.fetch_add(1, Ordering::AcqRel);

    // The load runs in its own task so it completes even if every waiter
    // goes away.
    let task = tokio::spawn(run_load(shared, handle, epoch));
    async move {
        task.await.unwrap_or_else(|e| {
            Err(ReadyError::new(
                ReadyFailure::Interrupted,
                format!("model load task failed: {e}"),
            ))
        })
    }
    .boxed()
    .shared()
}

async fn run_load(
    shared: Arc<GatewayShared>,
    handle: Arc<dyn UpstreamChannel>,
    epoch: u64,
) -> Result<(), ReadyError> {
    let timeout = shared.config.timeouts.load();
    info!(timeout_secs = timeout.as_secs(), "Loading upstream models");

    let loaded = match tokio::time::timeout(timeout, handle.load_models()).await {
        Ok(Ok(true)) => Ok(()),
        Ok(Ok(false)) => Err(ReadyError::new(
            ReadyFailure::Rejected,
            "upstream reported the model load as failed",
        )),
        Ok(Err(e)) if e.is_channel_fault() => {
            shared.transport_fault(epoch, &e.to_string());
            Err(ReadyError::new(ReadyFailure::Transport, e.to_string()))
        },
        Ok(Err(e)) => Err(ReadyError::new(ReadyFailure::Remote, e.to_string())),
        Err(_) => Err(ReadyError::new(
            ReadyFailure::Timeout,
            format!("model load took longer than {timeout:?}"),
        )),
    };

    let result = if shared.epoch() == epoch {
        apply_outcome(&shared, epoch, loaded)
    } else {
        Err(ReadyError::new(
            ReadyFailure::Interrupted,
            "gateway disconnected while models were loading",
        ))
    };

    shared.readiness.finish(epoch, &result);
    result
}

fn apply_outcome(
    shared: &GatewayShared,
    epoch: u64,
    loaded: Result<(), ReadyError>,
) -> Result<(), ReadyError> {
    match loaded {
        Ok(()) => {
            shared.state.observe(HealthSnapshot::from_probes(true, true));
            shared
                .state
                .transition(GatewayState::Ready, "models loaded")
                .map_err(|e| ReadyError::new(ReadyFailure::Interrupted, e.to_string()))?;
            info!("Upstream models ready");
            Ok(())
        },
        Err(err) => {
            warn!(kind = %err.kind, reason = %err.reason, "Model load failed");
            match err.kind {
                ReadyFailure::Timeout => shared.transport_fault(epoch, &err.to_string()),
                ReadyFailure::Transport => {},
                _ => {
                    let _ = shared
                        .state
                        .transition(GatewayState::Connected, "model load failed");
                },
            }
            Err(err)
        },
    }
}
