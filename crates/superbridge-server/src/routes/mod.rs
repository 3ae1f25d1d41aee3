//! Route table.

mod chat;
mod service;
mod sessions;

use axum::Router;
use axum::routing::{delete, get, post};
use superbridge_gateway::Gateway;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Header carrying the session id a chat reply belongs to.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Shared handler state.
#[derive(Clone, Debug)]
pub struct AppState {
    /// The one gateway every request goes through.
    pub gateway: Gateway,
}

/// Build the HTTP router for `gateway`.
#[must_use]
pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/", get(service::root))
        .route("/health", get(service::health))
        .route("/reconnect", post(service::reconnect))
        .route("/chat", post(chat::chat))
        .route("/sessions", get(sessions::list))
        .route("/sessions/{id}", delete(sessions::remove))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(AppState { gateway })
}
