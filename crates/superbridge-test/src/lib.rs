//! Superbridge Test - Shared test utilities for the gateway.
//!
//! This crate provides scripted stand-ins for the upstream service that can be
//! used across the Superbridge crates as a dev-dependency.
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! superbridge-test.workspace = true
//! ```
//!
//! Then use in your tests:
//!
//! ```rust,ignore
//! use superbridge_test::prelude::*;
//!
//! #[tokio::test]
//! async fn chat_roundtrip() {
//!     let upstream = MockUpstream::new().with_models_ready(true);
//!     upstream.script_session(42, ChatScript::new().chunk("hel").chunk("lo"));
//!
//!     let gateway = test_gateway(&upstream);
//!     let stream = gateway
//!         .chat(test_session(42), "hi", CancellationToken::new())
//!         .await
//!         .unwrap();
//!     assert_eq!(stream.collect_text().await.unwrap(), "hello");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod fixtures;
pub mod mock_server;
pub mod mock_upstream;

pub use fixtures::*;
pub use mock_server::*;
pub use mock_upstream::*;
