//! Superbridge Server - HTTP adapter for the upstream gateway.
//!
//! Exposes a [`Gateway`](superbridge_gateway::Gateway) to HTTP callers:
//!
//! | Method | Path               | Purpose                                   |
//! |--------|--------------------|-------------------------------------------|
//! | GET    | `/`                | Service info                              |
//! | GET    | `/health`          | Health report (always 200)                |
//! | POST   | `/chat`            | Streamed `text/plain` reply               |
//! | POST   | `/reconnect`       | Tear down and reopen the upstream channel |
//! | GET    | `/sessions`        | Upstream chat history                     |
//! | DELETE | `/sessions/{id}`   | Remove one upstream session               |
//!
//! The adapter holds no state of its own. Closing the HTTP connection drops
//! the response body, which drops the [`ChatStream`](superbridge_gateway::ChatStream)
//! and cancels the upstream call.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod prelude;

pub mod config;
pub mod error;
pub mod routes;
pub mod server;

pub use config::{SERVER_ENV_MAPPINGS, ServerConfig, ServerSection};
pub use error::ApiError;
pub use routes::{AppState, router};
pub use server::{run, warm_up};
