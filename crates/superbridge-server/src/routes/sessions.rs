//! Upstream chat history.

use axum::Json;
use axum::extract::{Path, State};
use serde_json::{Value, json};
use superbridge_gateway::{SessionId, SessionSummary};

use super::AppState;
use crate::error::ApiError;

pub(super) async fn list(
    State(state): State<AppState>,
) -> Result<Json<Vec<SessionSummary>>, ApiError> {
    Ok(Json(state.gateway.chat_history().await?))
}

pub(super) async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let success = state.gateway.remove_session(SessionId::new(id)).await?;
    Ok(Json(json!({ "success": success })))
}
