//! Gateway configuration.
//!
//! Loaded from the `[upstream]`, `[timeouts]` and `[chat]` tables of a TOML
//! file. Fields the file leaves unset fall back to environment variables (see
//! [`crate::env`]) and then to the defaults below.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::env::{GATEWAY_ENV_MAPPINGS, apply_env_fallbacks};
use crate::error::{GatewayError, GatewayResult};
use crate::session::DEFAULT_CLIENT_LABEL;
use crate::upstream::UpstreamTarget;

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Upstream endpoint.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Per-operation deadlines.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Chat multiplexing limits.
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Upstream endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Hostname or IP address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Label sent with probes and chats.
    #[serde(default = "default_client_name")]
    pub client_name: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_name: default_client_name(),
        }
    }
}

impl UpstreamConfig {
    /// Endpoint address.
    #[must_use]
    pub fn target(&self) -> UpstreamTarget {
        UpstreamTarget::new(self.host.clone(), self.port)
    }
}

/// Deadlines for each blocking operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Opening the channel.
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,

    /// Each of the two health probes.
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,

    /// The model load call.
    #[serde(default = "default_load_secs")]
    pub load_secs: u64,

    /// Waiting for the next chunk of a chat stream.
    #[serde(default = "default_chunk_secs")]
    pub chunk_secs: u64,

    /// Opening a chat stream.
    #[serde(default = "default_open_stream_secs")]
    pub open_stream_secs: u64,

    /// Session history requests.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,

    /// Best-effort goodbye sent before closing the channel.
    #[serde(default = "default_disconnect_ms")]
    pub disconnect_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            probe_secs: default_probe_secs(),
            load_secs: default_load_secs(),
            chunk_secs: default_chunk_secs(),
            open_stream_secs: default_open_stream_secs(),
            request_secs: default_request_secs(),
            disconnect_ms: default_disconnect_ms(),
        }
    }
}

impl TimeoutConfig {
    /// Connect deadline.
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    /// Probe deadline.
    #[must_use]
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }

    /// Model load deadline.
    #[must_use]
    pub fn load(&self) -> Duration {
        Duration::from_secs(self.load_secs)
    }

    /// Per-chunk deadline.
    #[must_use]
    pub fn chunk(&self) -> Duration {
        Duration::from_secs(self.chunk_secs)
    }

    /// Stream open deadline.
    #[must_use]
    pub fn open_stream(&self) -> Duration {
        Duration::from_secs(self.open_stream_secs)
    }

    /// Plain request deadline.
    #[must_use]
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    /// Goodbye deadline.
    #[must_use]
    pub fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect_ms)
    }

    /// Longest single request the transport must allow.
    #[must_use]
    pub fn longest_request(&self) -> Duration {
        self.load()
            .max(self.request())
            .max(self.probe())
            .max(self.open_stream())
    }
}

/// Chat multiplexing limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Streams allowed to run at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Callers allowed to wait for a free slot; beyond this new chats get `Busy`.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Chunks buffered between the upstream reader and the caller.
    #[serde(default = "default_buffer_chunks")]
    pub buffer_chunks: usize,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_depth: default_queue_depth(),
            buffer_chunks: default_buffer_chunks(),
        }
    }
}

impl GatewayConfig {
    /// Load from a TOML file, applying env fallbacks from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not parse, or fails validation.
    pub fn load<P: AsRef<Path>>(path: P) -> GatewayResult<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents, &crate::env::collect_env_vars())
    }

    /// Parse TOML text, applying env fallbacks from `env_vars`.
    ///
    /// # Errors
    ///
    /// Returns an error if the text does not parse or the result fails validation.
    pub fn from_toml_str<S: ::std::hash::BuildHasher>(
        contents: &str,
        env_vars: &HashMap<String, String, S>,
    ) -> GatewayResult<Self> {
        let mut root = toml::Value::Table(toml::from_str::<toml::Table>(contents)?);
        apply_env_fallbacks(&mut root, GATEWAY_ENV_MAPPINGS, env_vars);
        let config: Self = root.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the gateway relies on.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] describing the first violation.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.upstream.host.trim().is_empty() {
            return Err(GatewayError::Config("upstream.host must not be empty".into()));
        }
        if self.upstream.port == 0 {
            return Err(GatewayError::Config("upstream.port must not be 0".into()));
        }

        let t = &self.timeouts;
        for (name, value) in [
            ("connect_secs", t.connect_secs),
            ("probe_secs", t.probe_secs),
            ("load_secs", t.load_secs),
            ("chunk_secs", t.chunk_secs),
            ("open_stream_secs", t.open_stream_secs),
            ("request_secs", t.request_secs),
            ("disconnect_ms", t.disconnect_ms),
        ] {
            if value == 0 {
                return Err(GatewayError::Config(format!(
                    "timeouts.{name} must be greater than 0"
                )));
            }
        }

        if self.chat.max_concurrent == 0 {
            return Err(GatewayError::Config(
                "chat.max_concurrent must be greater than 0".into(),
            ));
        }
        if self.chat.buffer_chunks == 0 {
            return Err(GatewayError::Config(
                "chat.buffer_chunks must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_host() -> String {
    "localhost".into()
}

fn default_port() -> u16 {
    5006
}

fn default_client_name() -> String {
    DEFAULT_CLIENT_LABEL.into()
}

fn default_connect_secs() -> u64 {
    15
}

fn default_probe_secs() -> u64 {
    5
}

fn default_load_secs() -> u64 {
    120
}

fn default_chunk_secs() -> u64 {
    60
}

fn default_open_stream_secs() -> u64 {
    15
}

fn default_request_secs() -> u64 {
    30
}

fn default_disconnect_ms() -> u64 {
    1000
}

fn default_max_concurrent() -> usize {
    8
}

fn default_queue_depth() -> usize {
    32
}

fn default_buffer_chunks() -> usize {
    32
}
