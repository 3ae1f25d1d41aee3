//! In-process JSON-RPC upstream server.
//!
//! Serves the upstream method set over a real WebSocket, backed by a
//! [`MockUpstream`], so the WebSocket transport can be tested end to end.

use std::net::SocketAddr;

use futures::StreamExt;
use jsonrpsee::core::{SubscriptionResult, async_trait};
use jsonrpsee::server::{PendingSubscriptionSink, Server, ServerHandle, SubscriptionMessage};
use jsonrpsee::types::ErrorObjectOwned;
use tracing::debug;

use superbridge_gateway::upstream::protocol::{
    ChatChunk, ChatRequest, HelloReply, LoadModelsReply, RemoveSessionReply, SessionSummary,
    UpstreamRpcServer,
};
use superbridge_gateway::upstream::{UpstreamChannel, UpstreamError};
use superbridge_gateway::SessionId;

use crate::mock_upstream::{MOCK_REMOTE_CODE, MockUpstream};

/// JSON-RPC server side of the upstream protocol.
#[derive(Debug, Clone)]
pub struct MockRpcServer {
    upstream: MockUpstream,
}

impl MockRpcServer {
    /// Serve `upstream`.
    #[must_use]
    pub fn new(upstream: &MockUpstream) -> Self {
        Self {
            upstream: upstream.clone(),
        }
    }
}

fn to_error_object(err: UpstreamError) -> ErrorObjectOwned {
    match err {
        UpstreamError::Remote { code, message } => ErrorObjectOwned::owned(code, message, None::<()>),
        other => ErrorObjectOwned::owned(MOCK_REMOTE_CODE, other.to_string(), None::<()>),
    }
}

#[async_trait]
impl UpstreamRpcServer for MockRpcServer {
    async fn say_hello(&self, name: String) -> Result<HelloReply, ErrorObjectOwned> {
        let message = self.upstream.say_hello(&name).await.map_err(to_error_object)?;
        Ok(HelloReply { message })
    }

    async fn say_hello_llm(&self, name: String) -> Result<HelloReply, ErrorObjectOwned> {
        let message = self
            .upstream
            .say_hello_llm(&name)
            .await
            .map_err(to_error_object)?;
        Ok(HelloReply { message })
    }

    async fn load_models(&self) -> Result<LoadModelsReply, ErrorObjectOwned> {
        let status = self.upstream.load_models().await.map_err(to_error_object)?;
        Ok(LoadModelsReply { status })
    }

    async fn get_chat_history(&self) -> Result<Vec<SessionSummary>, ErrorObjectOwned> {
        self.upstream.chat_history().await.map_err(to_error_object)
    }

    async fn remove_session(&self, session_id: i64) -> Result<RemoveSessionReply, ErrorObjectOwned> {
        let success = self
            .upstream
            .remove_session(SessionId::new(session_id))
            .await
            .map_err(to_error_object)?;
        Ok(RemoveSessionReply { success })
    }

    async fn disconnect_client(&self) -> Result<(), ErrorObjectOwned> {
        self.upstream
            .disconnect_client()
            .await
            .map_err(to_error_object)
    }

    async fn chat(&self, pending: PendingSubscriptionSink, request: ChatRequest) -> SubscriptionResult {
        let mut chunks = match self.upstream.chat(request).await {
            Ok(chunks) => chunks,
            Err(e) => {
                pending.reject(to_error_object(e)).await;
                return Ok(());
            },
        };
        let sink = pending.accept().await?;

        while let Some(item) = chunks.next().await {
            match item {
                Ok(text) => {
                    let message = SubscriptionMessage::from_json(&ChatChunk::text(text))?;
                    sink.send(message).await?;
                },
                Err(e) => {
                    // Ending without the completion marker signals the failure.
                    debug!(error = %e, "Mock chat stream failed");
                    return Ok(());
                },
            }
        }

        sink.send(SubscriptionMessage::from_json(&ChatChunk::done())?)
            .await?;
        Ok(())
    }
}

/// Start a JSON-RPC server for `upstream` on an ephemeral local port.
///
/// # Panics
///
/// Panics if the server cannot bind.
pub async fn spawn_mock_server(upstream: &MockUpstream) -> (SocketAddr, ServerHandle) {
    let server = Server::builder()
        .build("127.0.0.1:0")
        .await
        .expect("Failed to bind mock upstream server");
    let addr = server
        .local_addr()
        .expect("Failed to read mock upstream address");
    let handle = server.start(MockRpcServer::new(upstream).into_rpc());
    (addr, handle)
}
