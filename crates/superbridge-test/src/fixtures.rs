//! Test fixtures.

use std::io::Write;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing_subscriber::EnvFilter;

use superbridge_gateway::{ChatSession, Connector, Gateway, GatewayConfig};

use crate::mock_upstream::{MockConnector, MockUpstream};

/// Label used by fixture sessions.
pub const TEST_CLIENT_LABEL: &str = "superbridge-test";

/// Gateway configuration with short timeouts, except the model load.
#[must_use]
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.upstream.host = "mock-upstream".into();
    config.upstream.client_name = TEST_CLIENT_LABEL.into();
    config.timeouts.connect_secs = 2;
    config.timeouts.probe_secs = 1;
    config.timeouts.chunk_secs = 5;
    config.timeouts.open_stream_secs = 2;
    config.timeouts.request_secs = 2;
    config.timeouts.disconnect_ms = 100;
    config
}

/// Session with the fixture label.
#[must_use]
pub fn test_session(session_id: i64) -> ChatSession {
    ChatSession::new(session_id, TEST_CLIENT_LABEL)
}

/// Disconnected gateway wired to `upstream` through a fresh [`MockConnector`].
#[must_use]
pub fn test_gateway(upstream: &MockUpstream) -> Gateway {
    test_gateway_with(upstream, test_config()).0
}

/// Gateway plus its connector, for tests that refuse connections.
#[must_use]
pub fn test_gateway_with(
    upstream: &MockUpstream,
    config: GatewayConfig,
) -> (Gateway, Arc<MockConnector>) {
    let connector = Arc::new(MockConnector::new(upstream));
    let gateway = Gateway::new(config, Arc::clone(&connector) as Arc<dyn Connector>);
    (gateway, connector)
}

/// Write `content` to a temporary `.toml` file.
///
/// # Panics
///
/// Panics if the file cannot be created or written.
#[must_use]
pub fn test_config_file(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write to temp file");
    file.flush().expect("Failed to flush temp file");
    file
}

/// Install a test log subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
