//! JSON-RPC over WebSocket implementation of the upstream traits.

use std::error::Error as StdError;
use std::io;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use jsonrpsee::core::ClientError;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use tracing::debug;

use super::protocol::{ChatRequest, SessionSummary, UpstreamRpcClient};
use super::{
    ChunkStream, Connector, TransportFailure, UpstreamChannel, UpstreamError, UpstreamResult,
    UpstreamTarget,
};
use crate::session::SessionId;

/// Opens [`WsUpstream`] channels.
#[derive(Debug, Clone)]
pub struct WsConnector {
    request_timeout: Duration,
}

impl WsConnector {
    /// Create a connector.
    ///
    /// `request_timeout` is the client-side ceiling for any single request. The
    /// gateway applies tighter per-operation deadlines on top, so this should be
    /// at least as long as the model load timeout.
    #[must_use]
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(
        &self,
        target: &UpstreamTarget,
        timeout: Duration,
    ) -> UpstreamResult<Arc<dyn UpstreamChannel>> {
        let url = target.ws_url();
        let client = WsClientBuilder::default()
            .connection_timeout(timeout)
            .request_timeout(self.request_timeout)
            .build(&url)
            .await
            .map_err(|e| classify_client_error(&e))?;

        debug!(url = %url, "Upstream WebSocket established");
        Ok(Arc::new(WsUpstream::new(client)))
    }
}

/// Upstream channel backed by one jsonrpsee WebSocket client.
pub struct WsUpstream {
    client: RwLock<Option<Arc<WsClient>>>,
}

impl WsUpstream {
    /// Wrap an established client.
    #[must_use]
    pub fn new(client: WsClient) -> Self {
        Self {
            client: RwLock::new(Some(Arc::new(client))),
        }
    }

    fn client(&self) -> UpstreamResult<Arc<WsClient>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| UpstreamError::transport(TransportFailure::Closed, "channel closed"))
    }
}

#[async_trait]
impl UpstreamChannel for WsUpstream {
    fn is_alive(&self) -> bool {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|c| c.is_connected())
    }

    async fn say_hello(&self, name: &str) -> UpstreamResult<String> {
        let client = self.client()?;
        let reply = client
            .say_hello(name.to_owned())
            .await
            .map_err(|e| classify_client_error(&e))?;
        Ok(reply.message)
    }

    async fn say_hello_llm(&self, name: &str) -> UpstreamResult<String> {
        let client = self.client()?;
        let reply = client
            .say_hello_llm(name.to_owned())
            .await
            .map_err(|e| classify_client_error(&e))?;
        Ok(reply.message)
    }

    async fn load_models(&self) -> UpstreamResult<bool> {
        let client = self.client()?;
        let reply = client
            .load_models()
            .await
            .map_err(|e| classify_client_error(&e))?;
        Ok(reply.status)
    }

    async fn chat(&self, request: ChatRequest) -> UpstreamResult<ChunkStream> {
        let client = self.client()?;
        let mut subscription = client
            .chat(request)
            .await
            .map_err(|e| classify_client_error(&e))?;

        let stream = async_stream::stream! {
            loop {
                match subscription.next().await {
                    Some(Ok(chunk)) => {
                        let done = chunk.done;
                        yield Ok(chunk.message);
                        if done {
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        yield Err(UpstreamError::Protocol(format!("malformed chat chunk: {e}")));
                        break;
                    },
                    None => {
                        if client.is_connected() {
                            yield Err(UpstreamError::Protocol(
                                "chat stream ended without completion marker".to_string(),
                            ));
                        } else {
                            yield Err(UpstreamError::transport(
                                TransportFailure::Closed,
                                "connection closed mid-stream",
                            ));
                        }
                        break;
                    },
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn chat_history(&self) -> UpstreamResult<Vec<SessionSummary>> {
        let client = self.client()?;
        client
            .get_chat_history()
            .await
            .map_err(|e| classify_client_error(&e))
    }

    async fn remove_session(&self, session_id: SessionId) -> UpstreamResult<bool> {
        let client = self.client()?;
        let reply = client
            .remove_session(session_id.get())
            .await
            .map_err(|e| classify_client_error(&e))?;
        Ok(reply.success)
    }

    async fn disconnect_client(&self) -> UpstreamResult<()> {
        let client = self.client()?;
        client
            .disconnect_client()
            .await
            .map_err(|e| classify_client_error(&e))
    }

    async fn close(&self) {
        // Dropping the last client handle stops its background task and closes
        // the socket; streams still holding a clone end when their call does.
        let taken = self
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_some() {
            debug!("Upstream WebSocket closed");
        }
    }
}

/// Map a jsonrpsee client error onto the upstream taxonomy.
pub(crate) fn classify_client_error(err: &ClientError) -> UpstreamError {
    match err {
        ClientError::Call(obj) => UpstreamError::Remote {
            code: obj.code(),
            message: obj.message().to_string(),
        },
        ClientError::Transport(_) => {
            UpstreamError::transport(transport_failure_kind(err), err.to_string())
        },
        ClientError::RestartNeeded(_) => {
            UpstreamError::transport(TransportFailure::Closed, err.to_string())
        },
        ClientError::RequestTimeout => UpstreamError::Timeout("upstream request".to_string()),
        other => UpstreamError::Protocol(other.to_string()),
    }
}

/// Inspect the error chain for the underlying socket failure.
fn transport_failure_kind(err: &(dyn StdError + 'static)) -> TransportFailure {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => return TransportFailure::Refused,
                io::ErrorKind::TimedOut => return TransportFailure::Timeout,
                io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                    return TransportFailure::Unreachable;
                },
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof => return TransportFailure::Closed,
                _ => {},
            }
        }
        current = e.source();
    }

    // Handshake errors do not always keep the io::Error as a source.
    let text = err.to_string().to_ascii_lowercase();
    if text.contains("refused") {
        TransportFailure::Refused
    } else if text.contains("unreachable") || text.contains("no route") {
        TransportFailure::Unreachable
    } else if text.contains("timed out") || text.contains("timeout") {
        TransportFailure::Timeout
    } else if text.contains("closed") || text.contains("reset") {
        TransportFailure::Closed
    } else {
        TransportFailure::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "handshake failed")
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn refused_found_in_source_chain() {
        let err = Wrapped(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(transport_failure_kind(&err), TransportFailure::Refused);
    }

    #[test]
    fn unreachable_found_in_source_chain() {
        let err = Wrapped(io::Error::from(io::ErrorKind::HostUnreachable));
        assert_eq!(transport_failure_kind(&err), TransportFailure::Unreachable);
    }

    #[test]
    fn falls_back_to_message_text() {
        let err = io::Error::other("Connection refused (os error 111)");
        assert_eq!(transport_failure_kind(&err), TransportFailure::Refused);

        let err = io::Error::other("something odd");
        assert_eq!(transport_failure_kind(&err), TransportFailure::Other);
    }

    #[test]
    fn request_timeout_is_operation_timeout() {
        let err = classify_client_error(&ClientError::RequestTimeout);
        assert!(matches!(err, UpstreamError::Timeout(_)));
        assert!(!err.is_channel_fault());
    }

    #[test]
    fn call_error_is_remote() {
        let obj = jsonrpsee::types::ErrorObjectOwned::owned(-32001, "models busy", None::<()>);
        let err = classify_client_error(&ClientError::Call(obj));
        assert_eq!(
            err,
            UpstreamError::Remote {
                code: -32001,
                message: "models busy".into()
            }
        );
    }
}
