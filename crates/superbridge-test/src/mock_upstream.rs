//! Scripted in-memory upstream.
//!
//! [`MockUpstream`] implements [`UpstreamChannel`] with behavior set up front by
//! the test: probe replies, how long a model load takes and how it ends, and
//! what each chat session streams. [`MockConnector`] hands it to the gateway
//! and can simulate refused connections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use superbridge_gateway::SessionId;
use superbridge_gateway::upstream::{
    ChatRequest, ChunkStream, Connector, MODELS_READY_ACK, SessionSummary, TransportFailure,
    UpstreamChannel, UpstreamError, UpstreamResult, UpstreamTarget,
};

/// Error code the mock uses for remote errors.
pub const MOCK_REMOTE_CODE: i32 = -32000;

// ---------------------------------------------------------------------------
// Scripts
// ---------------------------------------------------------------------------

/// How a scripted chat stream ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// Normal completion.
    Complete,
    /// The link drops; the whole mock goes dead.
    TransportDrop,
    /// The upstream reports an error for this call only.
    RemoteError(String),
    /// The stream stalls until the link is killed or the call is dropped.
    Hang,
}

/// Chunks one chat call streams, each after an optional delay.
#[derive(Debug, Clone)]
pub struct ChatScript {
    chunks: Vec<(Duration, String)>,
    end: StreamEnd,
}

impl ChatScript {
    /// An empty script that completes immediately.
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            end: StreamEnd::Complete,
        }
    }

    /// Append a chunk sent without delay.
    #[must_use]
    pub fn chunk(self, text: impl Into<String>) -> Self {
        self.chunk_after(Duration::ZERO, text)
    }

    /// Append a chunk sent `delay` after the previous one.
    #[must_use]
    pub fn chunk_after(mut self, delay: Duration, text: impl Into<String>) -> Self {
        self.chunks.push((delay, text.into()));
        self
    }

    /// Set how the stream ends.
    #[must_use]
    pub fn ending(mut self, end: StreamEnd) -> Self {
        self.end = end;
        self
    }

    /// Text of all chunks, concatenated.
    #[must_use]
    pub fn full_text(&self) -> String {
        self.chunks.iter().map(|(_, text)| text.as_str()).collect()
    }
}

impl Default for ChatScript {
    fn default() -> Self {
        Self::new()
    }
}

/// How the next model load ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Models become ready.
    Succeed,
    /// The upstream answers `status: false`.
    Reject,
    /// The upstream answers with an error object.
    RemoteError(String),
    /// The link drops mid-load.
    DropChannel,
}

// ---------------------------------------------------------------------------
// MockUpstream
// ---------------------------------------------------------------------------

struct Behavior {
    probe_delay: Duration,
    load_delay: Duration,
    load_outcome: LoadOutcome,
    default_script: ChatScript,
    scripts: HashMap<i64, ChatScript>,
    history: Vec<SessionSummary>,
    history_error: Option<String>,
}

struct Inner {
    alive: AtomicBool,
    middleware_up: AtomicBool,
    models_ready: AtomicBool,
    kill: Mutex<CancellationToken>,
    behavior: Mutex<Behavior>,
    requests: Mutex<Vec<ChatRequest>>,
    load_calls: AtomicUsize,
    hello_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    streams_opened: AtomicUsize,
    streams_dropped: Arc<AtomicUsize>,
}

/// Scriptable upstream. Clones share state.
#[derive(Clone)]
pub struct MockUpstream {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("lock poisoned")
}

fn closed(message: &str) -> UpstreamError {
    UpstreamError::transport(TransportFailure::Closed, message)
}

impl MockUpstream {
    /// A live upstream whose middleware answers and whose models are not loaded.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                alive: AtomicBool::new(true),
                middleware_up: AtomicBool::new(true),
                models_ready: AtomicBool::new(false),
                kill: Mutex::new(CancellationToken::new()),
                behavior: Mutex::new(Behavior {
                    probe_delay: Duration::ZERO,
                    load_delay: Duration::ZERO,
                    load_outcome: LoadOutcome::Succeed,
                    default_script: ChatScript::new().chunk("ok"),
                    scripts: HashMap::new(),
                    history: Vec::new(),
                    history_error: None,
                }),
                requests: Mutex::new(Vec::new()),
                load_calls: AtomicUsize::new(0),
                hello_calls: AtomicUsize::new(0),
                disconnect_calls: AtomicUsize::new(0),
                streams_opened: AtomicUsize::new(0),
                streams_dropped: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    /// Start with the models already loaded (or not).
    #[must_use]
    pub fn with_models_ready(self, ready: bool) -> Self {
        self.set_models_ready(ready);
        self
    }

    /// Make every model load take `delay`.
    #[must_use]
    pub fn with_load_delay(self, delay: Duration) -> Self {
        lock(&self.inner.behavior).load_delay = delay;
        self
    }

    /// Set how model loads end.
    #[must_use]
    pub fn with_load_outcome(self, outcome: LoadOutcome) -> Self {
        self.set_load_outcome(outcome);
        self
    }

    /// Delay both greeting probes by `delay`.
    #[must_use]
    pub fn with_probe_delay(self, delay: Duration) -> Self {
        lock(&self.inner.behavior).probe_delay = delay;
        self
    }

    /// Make the middleware greeting answer (or fail).
    pub fn set_middleware_up(&self, up: bool) {
        self.inner.middleware_up.store(up, Ordering::SeqCst);
    }

    /// Flip the model runtime state.
    pub fn set_models_ready(&self, ready: bool) {
        self.inner.models_ready.store(ready, Ordering::SeqCst);
    }

    /// Set how subsequent model loads end.
    pub fn set_load_outcome(&self, outcome: LoadOutcome) {
        lock(&self.inner.behavior).load_outcome = outcome;
    }

    /// Script the next chat call for `session_id`.
    pub fn script_session(&self, session_id: i64, script: ChatScript) {
        lock(&self.inner.behavior).scripts.insert(session_id, script);
    }

    /// Script every chat call without a session-specific script.
    pub fn set_default_script(&self, script: ChatScript) {
        lock(&self.inner.behavior).default_script = script;
    }

    /// Add a session to the upstream chat history.
    pub fn add_history(&self, sid: i64, name: &str) {
        lock(&self.inner.behavior).history.push(SessionSummary {
            sid,
            name: Some(name.to_string()),
            date: None,
        });
    }

    /// Make history lookups fail with a remote error.
    pub fn fail_history(&self, message: &str) {
        lock(&self.inner.behavior).history_error = Some(message.to_string());
    }

    /// Drop the link: the channel reports dead and open streams fail.
    pub fn kill(&self) {
        self.inner.alive.store(false, Ordering::SeqCst);
        lock(&self.inner.kill).cancel();
    }

    /// Accept links again after [`MockUpstream::kill`].
    pub fn revive(&self) {
        *lock(&self.inner.kill) = CancellationToken::new();
        self.inner.alive.store(true, Ordering::SeqCst);
    }

    /// Simulate an upstream restart: the link drops and the models unload.
    pub fn restart(&self) {
        self.kill();
        self.set_models_ready(false);
    }

    /// Number of `loadModels` calls received.
    #[must_use]
    pub fn load_calls(&self) -> usize {
        self.inner.load_calls.load(Ordering::SeqCst)
    }

    /// Number of middleware greetings received.
    #[must_use]
    pub fn hello_calls(&self) -> usize {
        self.inner.hello_calls.load(Ordering::SeqCst)
    }

    /// Number of `disconnectClient` calls received.
    #[must_use]
    pub fn disconnect_calls(&self) -> usize {
        self.inner.disconnect_calls.load(Ordering::SeqCst)
    }

    /// Number of chat streams opened.
    #[must_use]
    pub fn streams_opened(&self) -> usize {
        self.inner.streams_opened.load(Ordering::SeqCst)
    }

    /// Number of chat streams the gateway has dropped, finished or not.
    #[must_use]
    pub fn streams_dropped(&self) -> usize {
        self.inner.streams_dropped.load(Ordering::SeqCst)
    }

    /// Chat requests received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        lock(&self.inner.requests).clone()
    }

    fn check_alive(&self) -> UpstreamResult<()> {
        if self.inner.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(closed("mock upstream is down"))
        }
    }

    fn kill_token(&self) -> CancellationToken {
        lock(&self.inner.kill).clone()
    }

    async fn probe_pause(&self) -> UpstreamResult<()> {
        let delay = lock(&self.inner.behavior).probe_delay;
        let kill = self.kill_token();
        tokio::select! {
            () = kill.cancelled() => Err(closed("link dropped during probe")),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockUpstream")
            .field("alive", &self.inner.alive.load(Ordering::SeqCst))
            .field("models_ready", &self.inner.models_ready.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Counts a stream as dropped when the gateway lets go of it.
struct DropCounter(Arc<AtomicUsize>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl UpstreamChannel for MockUpstream {
    fn is_alive(&self) -> bool {
        self.inner.alive.load(Ordering::SeqCst)
    }

    async fn say_hello(&self, name: &str) -> UpstreamResult<String> {
        self.check_alive()?;
        self.inner.hello_calls.fetch_add(1, Ordering::SeqCst);
        self.probe_pause().await?;
        if self.inner.middleware_up.load(Ordering::SeqCst) {
            Ok(format!("Hello {name}"))
        } else {
            Err(UpstreamError::Remote {
                code: MOCK_REMOTE_CODE,
                message: "middleware unavailable".into(),
            })
        }
    }

    async fn say_hello_llm(&self, _name: &str) -> UpstreamResult<String> {
        self.check_alive()?;
        self.probe_pause().await?;
        if self.inner.models_ready.load(Ordering::SeqCst) {
            Ok(MODELS_READY_ACK.to_string())
        } else {
            Ok("not ready".to_string())
        }
    }

    async fn load_models(&self) -> UpstreamResult<bool> {
        self.check_alive()?;
        self.inner.load_calls.fetch_add(1, Ordering::SeqCst);

        let (delay, outcome) = {
            let behavior = lock(&self.inner.behavior);
            (behavior.load_delay, behavior.load_outcome.clone())
        };
        let kill = self.kill_token();
        tokio::select! {
            () = kill.cancelled() => return Err(closed("link dropped during load")),
            () = tokio::time::sleep(delay) => {},
        }

        match outcome {
            LoadOutcome::Succeed => {
                self.set_models_ready(true);
                Ok(true)
            },
            LoadOutcome::Reject => Ok(false),
            LoadOutcome::RemoteError(message) => Err(UpstreamError::Remote {
                code: MOCK_REMOTE_CODE,
                message,
            }),
            LoadOutcome::DropChannel => {
                self.kill();
                Err(closed("link dropped during load"))
            },
        }
    }

    async fn chat(&self, request: ChatRequest) -> UpstreamResult<ChunkStream> {
        self.check_alive()?;
        let script = {
            let mut behavior = lock(&self.inner.behavior);
            behavior
                .scripts
                .remove(&request.session_id)
                .unwrap_or_else(|| behavior.default_script.clone())
        };
        lock(&self.inner.requests).push(request);
        self.inner.streams_opened.fetch_add(1, Ordering::SeqCst);

        let kill = self.kill_token();
        let counter = DropCounter(Arc::clone(&self.inner.streams_dropped));
        let upstream = self.clone();

        let stream = async_stream::stream! {
            let _counter = counter;
            let mut dropped = false;

            for (delay, text) in script.chunks {
                tokio::select! {
                    () = kill.cancelled() => dropped = true,
                    () = tokio::time::sleep(delay) => {},
                }
                if dropped {
                    break;
                }
                yield Ok(text);
            }

            if dropped {
                yield Err(closed("link dropped mid-stream"));
            } else {
                match script.end {
                    StreamEnd::Complete => {},
                    StreamEnd::TransportDrop => {
                        upstream.kill();
                        yield Err(closed("link dropped mid-stream"));
                    },
                    StreamEnd::RemoteError(message) => {
                        yield Err(UpstreamError::Remote { code: MOCK_REMOTE_CODE, message });
                    },
                    StreamEnd::Hang => {
                        kill.cancelled().await;
                        yield Err(closed("link dropped mid-stream"));
                    },
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn chat_history(&self) -> UpstreamResult<Vec<SessionSummary>> {
        self.check_alive()?;
        let behavior = lock(&self.inner.behavior);
        match &behavior.history_error {
            Some(message) => Err(UpstreamError::Remote {
                code: MOCK_REMOTE_CODE,
                message: message.clone(),
            }),
            None => Ok(behavior.history.clone()),
        }
    }

    async fn remove_session(&self, session_id: SessionId) -> UpstreamResult<bool> {
        self.check_alive()?;
        let mut behavior = lock(&self.inner.behavior);
        let before = behavior.history.len();
        behavior.history.retain(|s| s.sid != session_id.get());
        Ok(behavior.history.len() != before)
    }

    async fn disconnect_client(&self) -> UpstreamResult<()> {
        self.check_alive()?;
        self.inner.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.kill();
    }
}

// ---------------------------------------------------------------------------
// MockConnector
// ---------------------------------------------------------------------------

/// Connector handing out one shared [`MockUpstream`].
///
/// Each successful open revives the upstream, so a killed or restarted mock
/// comes back on the next connect.
#[derive(Debug)]
pub struct MockConnector {
    upstream: MockUpstream,
    failures_left: AtomicUsize,
    opens: AtomicUsize,
}

impl MockConnector {
    /// Connector for `upstream`.
    #[must_use]
    pub fn new(upstream: &MockUpstream) -> Self {
        Self {
            upstream: upstream.clone(),
            failures_left: AtomicUsize::new(0),
            opens: AtomicUsize::new(0),
        }
    }

    /// Refuse the next `count` opens.
    pub fn refuse_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of open attempts, failed or not.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(
        &self,
        target: &UpstreamTarget,
        _timeout: Duration,
    ) -> UpstreamResult<Arc<dyn UpstreamChannel>> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(UpstreamError::transport(
                TransportFailure::Refused,
                format!("connection to {target} refused"),
            ));
        }

        self.upstream.revive();
        Ok(Arc::new(self.upstream.clone()))
    }
}
