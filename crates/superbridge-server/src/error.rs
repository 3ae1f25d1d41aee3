//! HTTP error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use superbridge_gateway::GatewayError;
use thiserror::Error;

/// An error rendered as `{error, detail}` with a status code.
#[derive(Debug, Error)]
#[error("{code}: {detail}")]
pub struct ApiError {
    /// HTTP status.
    pub status: StatusCode,
    /// Short machine-readable code.
    pub code: &'static str,
    /// Human-readable detail.
    pub detail: String,
}

impl ApiError {
    /// Create an error.
    #[must_use]
    pub fn new(status: StatusCode, code: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            code,
            detail: detail.into(),
        }
    }

    /// 400 with `bad_request`.
    #[must_use]
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", detail)
    }

    /// 503 with `service_unavailable`.
    #[must_use]
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "service_unavailable", detail)
    }

    /// 500 with `internal_error`.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", detail)
    }
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let detail = err.to_string();
        match err {
            GatewayError::Unavailable(_) | GatewayError::NotConnected | GatewayError::Ready(_) => {
                Self::unavailable(detail)
            },
            GatewayError::Busy { .. } => Self::new(StatusCode::TOO_MANY_REQUESTS, "busy", detail),
            GatewayError::Transport { .. } | GatewayError::Remote { .. } | GatewayError::Call(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "upstream_error", detail)
            },
            GatewayError::Timeout(_) => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", detail)
            },
            GatewayError::InvalidTransition { .. }
            | GatewayError::Config(_)
            | GatewayError::Io(_)
            | GatewayError::Toml(_) => Self::internal(detail),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({
                "error": self.code,
                "detail": self.detail,
            })),
        )
            .into_response()
    }
}
