//! Common imports for embedding the HTTP adapter.
//!
//! ```rust,ignore
//! use superbridge_server::prelude::*;
//! ```

pub use crate::{ApiError, AppState, ServerConfig, ServerSection, router, run, warm_up};
