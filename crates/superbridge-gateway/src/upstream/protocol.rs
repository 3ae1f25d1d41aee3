//! JSON-RPC method set spoken by the upstream service.
//!
//! The gateway implements the client side; the in-process mock server used in
//! tests implements the server side.

use jsonrpsee::proc_macros::rpc;
use jsonrpsee::types::ErrorObjectOwned;
use serde::{Deserialize, Serialize};

// ---------- Wire types ----------

/// Reply to the greeting probes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    /// Greeting text. Meaning depends on the probe.
    #[serde(default)]
    pub message: String,
}

/// Reply to `loadModels`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadModelsReply {
    /// Whether the upstream accepted and completed the load.
    pub status: bool,
}

/// Parameters of one chat call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// Client label.
    pub name: String,
    /// User prompt.
    pub prompt: String,
    /// Conversation key owned by the upstream.
    pub session_id: i64,
}

/// One notification of a chat subscription.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Text fragment. May be empty.
    #[serde(default)]
    pub message: String,
    /// Set on the final notification of the call.
    #[serde(default)]
    pub done: bool,
}

impl ChatChunk {
    /// A text fragment.
    #[must_use]
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            done: false,
        }
    }

    /// The completion marker.
    #[must_use]
    pub fn done() -> Self {
        Self {
            message: String::new(),
            done: true,
        }
    }
}

/// One entry of the upstream chat history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id.
    pub sid: i64,
    /// Display name, if the upstream keeps one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Last activity timestamp as reported upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// Reply to `removeSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveSessionReply {
    /// Whether the session existed and was removed.
    pub success: bool,
}

// ---------- RPC trait ----------

/// Upstream inference service API.
#[rpc(server, client, namespace = "superbuilder")]
pub trait UpstreamRpc {
    /// Middleware liveness greeting.
    #[method(name = "sayHello")]
    async fn say_hello(&self, name: String) -> Result<HelloReply, ErrorObjectOwned>;

    /// Model runtime greeting.
    #[method(name = "sayHelloLlm")]
    async fn say_hello_llm(&self, name: String) -> Result<HelloReply, ErrorObjectOwned>;

    /// Load the models. Long-running.
    #[method(name = "loadModels")]
    async fn load_models(&self) -> Result<LoadModelsReply, ErrorObjectOwned>;

    /// List sessions with stored history.
    #[method(name = "getChatHistory")]
    async fn get_chat_history(&self) -> Result<Vec<SessionSummary>, ErrorObjectOwned>;

    /// Remove a session's history.
    #[method(name = "removeSession")]
    async fn remove_session(&self, session_id: i64)
    -> Result<RemoveSessionReply, ErrorObjectOwned>;

    /// Announce that this client is leaving.
    #[method(name = "disconnectClient")]
    async fn disconnect_client(&self) -> Result<(), ErrorObjectOwned>;

    /// Stream a chat reply as `chatChunk` notifications.
    #[subscription(name = "chat" => "chatChunk", unsubscribe = "chatUnsubscribe", item = ChatChunk)]
    async fn chat(&self, request: ChatRequest) -> jsonrpsee::core::SubscriptionResult;
}
