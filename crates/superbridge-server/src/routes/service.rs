//! Service-level endpoints: info, health and reconnect.

use axum::Json;
use axum::extract::State;
use serde_json::{Value, json};
use superbridge_gateway::{HealthReport, ReconnectReport};
use superbridge_telemetry::RequestContext;
use tracing::{Instrument, info, warn};

use super::AppState;
use crate::error::ApiError;

pub(super) async fn root(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "name": "superbridge",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "state": state.gateway.state(),
        "health": "/health",
        "endpoints": ["/health", "/chat", "/reconnect", "/sessions"],
    }))
}

/// Always 200; the body says whether the upstream is usable.
pub(super) async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    let ctx = RequestContext::new("http").with_operation("health");
    Json(state.gateway.health().instrument(ctx.span()).await)
}

pub(super) async fn reconnect(
    State(state): State<AppState>,
) -> Result<Json<ReconnectReport>, ApiError> {
    let ctx = RequestContext::new("http").with_operation("reconnect");
    let span = ctx.span();
    match state.gateway.reconnect().instrument(span.clone()).await {
        Ok(report) => {
            info!(parent: &span, models_loaded = report.models_loaded, "Reconnect finished");
            Ok(Json(report))
        },
        Err(e) => {
            warn!(parent: &span, error = %e, "Reconnect failed");
            Err(ApiError::unavailable(format!("Failed to reconnect: {e}")))
        },
    }
}
