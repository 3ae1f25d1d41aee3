//! Streamed chat.

use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use futures::StreamExt;
use serde::Deserialize;
use superbridge_gateway::{ChatError, ChatSession, ChatStream, SessionId};
use superbridge_telemetry::RequestContext;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, warn};

use super::{AppState, SESSION_ID_HEADER};
use crate::error::ApiError;

/// Body of `POST /chat`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ChatRequest {
    prompt: String,
    #[serde(default)]
    session_id: Option<i64>,
    #[serde(default)]
    name: Option<String>,
}

pub(super) async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    if request.prompt.trim().is_empty() {
        return Err(ApiError::bad_request("prompt must not be empty"));
    }

    let gateway = &state.gateway;
    let session_id = match request.session_id {
        Some(id) => SessionId::new(id),
        None => gateway.allocate_session_id().await,
    };
    let label = request
        .name
        .unwrap_or_else(|| gateway.config().upstream.client_name.clone());

    let ctx = RequestContext::new("http")
        .with_operation("chat")
        .with_session_id(session_id.get());
    let span = ctx.span();

    let stream = gateway
        .chat(
            ChatSession::new(session_id, label),
            request.prompt,
            CancellationToken::new(),
        )
        .instrument(span.clone())
        .await
        .inspect_err(|e| warn!(parent: &span, error = %e, "Chat rejected"))?;

    Response::builder()
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .header(SESSION_ID_HEADER, session_id.to_string())
        .body(Body::from_stream(relay(stream, ctx, span)))
        .map_err(|e| ApiError::internal(e.to_string()))
}

/// Forward chunks to the response body.
///
/// An error item ends the body without trailing text; the failure shows up in
/// the log and in `/health` as `lastCallError`.
fn relay(
    stream: ChatStream,
    ctx: RequestContext,
    span: Span,
) -> impl futures::Stream<Item = Result<String, ChatError>> + Send + 'static {
    let mut log = RelayLog {
        ctx,
        span,
        chunks: 0,
    };
    stream.map(move |item| {
        match &item {
            Ok(_) => log.chunks = log.chunks.saturating_add(1),
            Err(e) => warn!(
                parent: &log.span,
                category = %e.category,
                error = %e.message,
                "Chat stream failed"
            ),
        }
        item
    })
}

/// Logs completion of a relayed reply when the body is dropped.
struct RelayLog {
    ctx: RequestContext,
    span: Span,
    chunks: usize,
}

impl Drop for RelayLog {
    fn drop(&mut self) {
        debug!(
            parent: &self.span,
            chunks = self.chunks,
            elapsed_ms = self.ctx.elapsed_ms(),
            "Chat response finished"
        );
    }
}
