//! Chat stream proxy.
//!
//! Each chat call is a pipe: a producer task reads the upstream
//! [`ChunkStream`] and pushes text into a bounded channel, and the caller
//! drains it through a [`ChatStream`]. The caller's cancellation token and the
//! gateway's abort signal are both observed at every suspension point of the
//! producer.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc, oneshot};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::config::{ChatConfig, TimeoutConfig};
use crate::error::{ChatError, ErrorCategory, GatewayError, GatewayResult};
use crate::session::{ChatSession, SessionId};
use crate::shared::GatewayShared;
use crate::upstream::{ChatRequest, ChunkStream, UpstreamChannel};

/// Identifier of one in-flight chat call.
pub type CallId = u64;

/// Public view of an active chat stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InFlightCall {
    /// Call identifier.
    pub call_id: CallId,
    /// Session the call belongs to.
    pub session_id: SessionId,
    /// When the upstream stream was opened.
    pub started_at: DateTime<Utc>,
}

struct Entry {
    session_id: SessionId,
    started_at: DateTime<Utc>,
    abort: oneshot::Sender<ChatError>,
}

/// Registry of active chat calls.
///
/// The lock is held only to insert, remove or drain entries.
#[derive(Default)]
pub(crate) struct InFlightRegistry {
    next_id: AtomicU64,
    calls: Mutex<HashMap<CallId, Entry>>,
}

impl InFlightRegistry {
    fn register(&self, session_id: SessionId) -> (CallId, oneshot::Receiver<ChatError>) {
        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (abort, abort_rx) = oneshot::channel();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                call_id,
                Entry {
                    session_id,
                    started_at: Utc::now(),
                    abort,
                },
            );
        (call_id, abort_rx)
    }

    fn remove(&self, call_id: CallId) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&call_id);
    }

    /// Abort every registered call with `reason`. Returns how many were aborted.
    pub(crate) fn abort_all(&self, reason: &ChatError) -> usize {
        let drained: Vec<Entry> = self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, entry)| entry)
            .collect();

        let count = drained.len();
        for entry in drained {
            // The producer may already be finishing; a closed receiver is fine.
            let _ = entry.abort.send(reason.clone());
        }
        if count > 0 {
            debug!(count, category = %reason.category, "Aborted in-flight chat calls");
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn snapshot(&self) -> Vec<InFlightCall> {
        let mut calls: Vec<InFlightCall> = self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, entry)| InFlightCall {
                call_id: *id,
                session_id: entry.session_id,
                started_at: entry.started_at,
            })
            .collect();
        calls.sort_by_key(|c| c.call_id);
        calls
    }
}

/// Releases a wait-queue slot when dropped.
struct QueueSlot<'a>(&'a AtomicUsize);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Admission control and stream setup for chat calls.
pub(crate) struct ChatStreamProxy {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    queue_depth: usize,
    waiting: AtomicUsize,
    buffer_chunks: usize,
    open_timeout: Duration,
    chunk_timeout: Duration,
}

impl ChatStreamProxy {
    pub(crate) fn new(chat: &ChatConfig, timeouts: &TimeoutConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(chat.max_concurrent)),
            max_concurrent: chat.max_concurrent,
            queue_depth: chat.queue_depth,
            waiting: AtomicUsize::new(0),
            buffer_chunks: chat.buffer_chunks.max(1),
            open_timeout: timeouts.open_stream(),
            chunk_timeout: timeouts.chunk(),
        }
    }

    /// Take a concurrency slot, waiting in the bounded queue if needed.
    ///
    /// Returns `Ok(None)` if `cancel` fires while waiting.
    pub(crate) async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> GatewayResult<Option<OwnedSemaphorePermit>> {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(Some(permit));
        }

        let queued = self.waiting.fetch_add(1, Ordering::AcqRel);
        let _slot = QueueSlot(&self.waiting);
        if queued >= self.queue_depth {
            return Err(GatewayError::Busy {
                in_flight: self
                    .max_concurrent
                    .saturating_sub(self.permits.available_permits()),
                queued,
            });
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(None),
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map(Some)
                .map_err(|_| GatewayError::Unavailable("chat proxy shut down".into())),
        }
    }

    /// Callers currently waiting for a slot.
    pub(crate) fn queued(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Open the upstream stream and start relaying it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn start(
        &self,
        shared: &Arc<GatewayShared>,
        handle: Arc<dyn UpstreamChannel>,
        epoch: u64,
        session: ChatSession,
        prompt: String,
        cancel: CancellationToken,
        permit: OwnedSemaphorePermit,
    ) -> GatewayResult<ChatStream> {
        let session_id = session.session_id;
        let request = ChatRequest {
            name: session.client_label,
            prompt,
            session_id: session_id.get(),
        };

        let opened = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(ChatStream::finished(session_id)),
            opened = tokio::time::timeout(self.open_timeout, handle.chat(request)) => opened,
        };

        let upstream = match opened {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                if e.is_channel_fault() {
                    shared.transport_fault(epoch, &e.to_string());
                }
                shared.record_call_failure(session_id, &ChatError::from_upstream(&e));
                return Err(GatewayError::from(e));
            },
            Err(_) => {
                let message = format!(
                    "opening chat stream took longer than {:?}",
                    self.open_timeout
                );
                shared.record_call_failure(
                    session_id,
                    &ChatError::new(ErrorCategory::Timeout, message.clone()),
                );
                return Err(GatewayError::Timeout(message));
            },
        };

        let (call_id, abort_rx) = shared.calls.register(session_id);

        // A fault may have drained the registry between admission and here.
        if !shared.state.current().accepts_calls() || shared.epoch() != epoch {
            shared.calls.remove(call_id);
            return Err(GatewayError::Unavailable(
                "gateway left the ready state while the stream was opening".into(),
            ));
        }

        let call_token = cancel.child_token();
        let (tx, rx) = mpsc::channel(self.buffer_chunks);

        let relay = Relay {
            shared: Arc::clone(shared),
            epoch,
            call_id,
            session_id,
            chunk_timeout: self.chunk_timeout,
            cancel: call_token.clone(),
            permit,
        };
        tokio::spawn(relay.run(upstream, tx, abort_rx));

        debug!(call_id, session_id = %session_id, "Chat stream opened");

        Ok(ChatStream {
            session_id,
            call_id: Some(call_id),
            rx: Some(rx),
            token: call_token.clone(),
            _guard: Some(call_token.drop_guard()),
        })
    }
}

/// Producer side of one chat pipe.
struct Relay {
    shared: Arc<GatewayShared>,
    epoch: u64,
    call_id: CallId,
    session_id: SessionId,
    chunk_timeout: Duration,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
}

enum Step {
    Forward(String),
    Fail(ChatError),
    Stop,
}

impl Relay {
    async fn run(
        self,
        mut upstream: ChunkStream,
        tx: mpsc::Sender<Result<String, ChatError>>,
        mut abort_rx: oneshot::Receiver<ChatError>,
    ) {
        let mut terminal = None;
        loop {
            let step = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    debug!(call_id = self.call_id, "Chat cancelled by caller");
                    Step::Stop
                },
                aborted = &mut abort_rx => match aborted {
                    Ok(reason) => Step::Fail(reason),
                    Err(_) => Step::Stop,
                },
                next = tokio::time::timeout(self.chunk_timeout, upstream.next()) => match next {
                    Ok(Some(Ok(text))) if text.is_empty() => continue,
                    Ok(Some(Ok(text))) => Step::Forward(text),
                    Ok(Some(Err(e))) => {
                        if e.is_channel_fault() {
                            self.shared.transport_fault(self.epoch, &e.to_string());
                        }
                        Step::Fail(ChatError::from_upstream(&e))
                    },
                    Ok(None) => Step::Stop,
                    Err(_) => Step::Fail(ChatError::new(
                        ErrorCategory::Timeout,
                        format!("no chunk within {:?}", self.chunk_timeout),
                    )),
                },
            };

            match step {
                Step::Forward(text) => {
                    // A caller that stopped draining must not pin the call past an abort.
                    let sent = tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => false,
                        aborted = &mut abort_rx => {
                            terminal = aborted.ok();
                            false
                        },
                        sent = tx.send(Ok(text)) => sent.is_ok(),
                    };
                    if !sent {
                        break;
                    }
                },
                Step::Fail(err) => {
                    terminal = Some(err);
                    break;
                },
                Step::Stop => break,
            }
        }

        // Dropping the upstream stream aborts the upstream call.
        drop(upstream);
        drop(self.permit);
        self.shared.calls.remove(self.call_id);

        if let Some(err) = terminal {
            warn!(
                call_id = self.call_id,
                session_id = %self.session_id,
                category = %err.category,
                error = %err.message,
                "Chat stream failed"
            );
            self.shared.record_call_failure(self.session_id, &err);
            // Only the pipe is held from here on.
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {},
                _ = tx.send(Err(err)) => {},
            }
        }
        debug!(call_id = self.call_id, "Chat stream closed");
    }
}

/// Caller side of one chat call.
///
/// Yields text chunks in upstream order. A failure is delivered as one final
/// `Err` item. Cancellation (through the caller's token, [`ChatStream::cancel`]
/// or dropping the stream) ends the sequence without further items.
pub struct ChatStream {
    session_id: SessionId,
    call_id: Option<CallId>,
    rx: Option<mpsc::Receiver<Result<String, ChatError>>>,
    token: CancellationToken,
    _guard: Option<DropGuard>,
}

impl ChatStream {
    /// An already-finished stream, returned when a call is cancelled before it starts.
    #[must_use]
    pub fn finished(session_id: SessionId) -> Self {
        let token = CancellationToken::new();
        token.cancel();
        Self {
            session_id,
            call_id: None,
            rx: None,
            token,
            _guard: None,
        }
    }

    /// Session this stream belongs to.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// In-flight call id, if the upstream call was started.
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        self.call_id
    }

    /// Stop the call. No further items are yielded.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Drain the whole stream into one string, stopping at the first error.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`ChatError`] if the call failed.
    pub async fn collect_text(mut self) -> Result<String, ChatError> {
        let mut text = String::new();
        while let Some(item) = self.next().await {
            text.push_str(&item?);
        }
        Ok(text)
    }
}

impl Stream for ChatStream {
    type Item = Result<String, ChatError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_cancelled() {
            this.rx = None;
            return Poll::Ready(None);
        }
        match this.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("session_id", &self.session_id)
            .field("call_id", &self.call_id)
            .field("cancelled", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finished_stream_is_empty() {
        let mut stream = ChatStream::finished(SessionId::new(1));
        assert!(stream.next().await.is_none());
        assert!(stream.call_id().is_none());
    }

    #[test]
    fn registry_abort_all_drains_and_signals() {
        let registry = InFlightRegistry::default();
        let (_a, mut rx_a) = registry.register(SessionId::new(42));
        let (_b, mut rx_b) = registry.register(SessionId::new(43));
        assert_eq!(registry.len(), 2);

        let reason = ChatError::new(ErrorCategory::Aborted, "disconnecting");
        assert_eq!(registry.abort_all(&reason), 2);
        assert_eq!(registry.len(), 0);
        assert_eq!(rx_a.try_recv().unwrap(), reason);
        assert_eq!(rx_b.try_recv().unwrap().category, ErrorCategory::Aborted);
    }

    #[test]
    fn registry_snapshot_is_ordered() {
        let registry = InFlightRegistry::default();
        let (first, _rx1) = registry.register(SessionId::new(7));
        let (second, _rx2) = registry.register(SessionId::new(8));
        registry.remove(first);

        let calls = registry.snapshot();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].call_id, second);
        assert_eq!(calls[0].session_id, SessionId::new(8));
    }

    #[tokio::test]
    async fn queue_rejects_when_full() {
        let chat = ChatConfig {
            max_concurrent: 1,
            queue_depth: 0,
            buffer_chunks: 4,
        };
        let proxy = ChatStreamProxy::new(&chat, &TimeoutConfig::default());
        let cancel = CancellationToken::new();

        let held = proxy.acquire(&cancel).await.unwrap();
        assert!(held.is_some());

        let err = proxy.acquire(&cancel).await.unwrap_err();
        assert!(matches!(err, GatewayError::Busy { in_flight: 1, .. }));
        assert_eq!(proxy.queued(), 0);
    }

    #[tokio::test]
    async fn cancelled_while_queued_returns_none() {
        let chat = ChatConfig {
            max_concurrent: 1,
            queue_depth: 4,
            buffer_chunks: 4,
        };
        let proxy = ChatStreamProxy::new(&chat, &TimeoutConfig::default());
        let _held = proxy.acquire(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(proxy.acquire(&cancel).await.unwrap().is_none());
        assert_eq!(proxy.queued(), 0);
    }
}
