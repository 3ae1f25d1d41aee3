//! Server configuration.
//!
//! One TOML file carries the gateway tables (`[upstream]`, `[timeouts]`,
//! `[chat]`) next to `[server]` and `[logging]`:
//!
//! ```toml
//! [upstream]
//! host = "127.0.0.1"
//! port = 5006
//!
//! [server]
//! listen = "0.0.0.0:8003"
//!
//! [logging]
//! level = "debug"
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use superbridge_gateway::env::{
    EnvMapping, GATEWAY_ENV_MAPPINGS, ValueKind, apply_env_fallbacks, collect_env_vars,
};
use superbridge_gateway::{GatewayConfig, GatewayError, GatewayResult};
use superbridge_telemetry::LogConfig;

/// Name of the config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "superbridge.toml";

/// Env var fallbacks for the server-only tables.
pub const SERVER_ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "SUPERBRIDGE_LISTEN",
        field_path: "server.listen",
        kind: ValueKind::String,
    },
    EnvMapping {
        var_name: "SUPERBRIDGE_LOG_LEVEL",
        field_path: "logging.level",
        kind: ValueKind::String,
    },
];

/// Complete configuration of the `superbridge` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Gateway tables, flattened to the top level.
    #[serde(flatten)]
    pub gateway: GatewayConfig,

    /// HTTP listener.
    #[serde(default)]
    pub server: ServerSection,

    /// Logging.
    #[serde(default)]
    pub logging: LogConfig,
}

/// The `[server]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Socket address to bind.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Connect and load models before accepting requests.
    #[serde(default = "default_true")]
    pub connect_on_startup: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            connect_on_startup: true,
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8003".into()
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] when it exists, or
    /// from defaults plus environment.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file cannot be read, or if the result
    /// does not parse or validate.
    pub fn load(path: Option<&Path>) -> GatewayResult<Self> {
        let contents = match path {
            Some(path) => std::fs::read_to_string(path)?,
            None => match std::fs::read_to_string(DEFAULT_CONFIG_FILE) {
                Ok(contents) => contents,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
                Err(e) => return Err(e.into()),
            },
        };
        Self::from_toml_str(&contents, &collect_env_vars())
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
        apply_env_fallbacks(&mut root, SERVER_ENV_MAPPINGS, env_vars);
        let config: Self = root.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the gateway invariants and the listen address.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] describing the first violation.
    pub fn validate(&self) -> GatewayResult<()> {
        self.gateway.validate()?;
        self.listen_addr()?;
        Ok(())
    }

    /// Parsed `server.listen`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] if the address does not parse.
    pub fn listen_addr(&self) -> GatewayResult<SocketAddr> {
        self.server.listen.parse().map_err(|e| {
            GatewayError::Config(format!(
                "server.listen '{}' is not a socket address: {e}",
                self.server.listen
            ))
        })
    }
}
