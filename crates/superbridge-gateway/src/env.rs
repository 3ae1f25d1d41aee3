//! Environment variable fallbacks for configuration.
//!
//! Env vars are **fallback**, not override: a mapping is applied only when the
//! config file left its field unset. Earlier mappings for the same field win.

use std::collections::HashMap;

use tracing::debug;

/// How an env var value is written into the TOML tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Kept as a string.
    String,
    /// Parsed as an integer; left as a string (and rejected later) if it does not parse.
    Integer,
    /// Parsed as a boolean; left as a string if it does not parse.
    Boolean,
}

/// Mapping from an environment variable to a dotted config field path.
#[derive(Debug, Clone, Copy)]
pub struct EnvMapping {
    /// Environment variable name.
    pub var_name: &'static str,
    /// Dotted path, e.g. `upstream.port`.
    pub field_path: &'static str,
    /// Value type of the field.
    pub kind: ValueKind,
}

/// Mappings for the gateway sections.
pub const GATEWAY_ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "SUPERBRIDGE_UPSTREAM_HOST",
        field_path: "upstream.host",
        kind: ValueKind::String,
    },
    EnvMapping {
        var_name: "SUPERBRIDGE_UPSTREAM_PORT",
        field_path: "upstream.port",
        kind: ValueKind::Integer,
    },
    // Names used by existing deployments of the upstream service.
    EnvMapping {
        var_name: "SUPERBUILDER_GRPC_HOST",
        field_path: "upstream.host",
        kind: ValueKind::String,
    },
    EnvMapping {
        var_name: "SUPERBUILDER_GRPC_PORT",
        field_path: "upstream.port",
        kind: ValueKind::Integer,
    },
    EnvMapping {
        var_name: "SUPERBRIDGE_CLIENT_NAME",
        field_path: "upstream.client_name",
        kind: ValueKind::String,
    },
    EnvMapping {
        var_name: "SUPERBRIDGE_CHAT_MAX_CONCURRENT",
        field_path: "chat.max_concurrent",
        kind: ValueKind::Integer,
    },
    EnvMapping {
        var_name: "SUPERBRIDGE_LOAD_TIMEOUT_SECS",
        field_path: "timeouts.load_secs",
        kind: ValueKind::Integer,
    },
];

/// Apply `mappings` to fields of `root` that are not already set.
///
/// Returns the number of env vars applied.
pub fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    root: &mut toml::Value,
    mappings: &[EnvMapping],
    env_vars: &HashMap<String, String, S>,
) -> usize {
    let mut count: usize = 0;

    for mapping in mappings {
        if field_is_set(root, mapping.field_path) {
            continue;
        }

        if let Some(val) = env_vars.get(mapping.var_name) {
            debug!(
                var = mapping.var_name,
                field = mapping.field_path,
                "Applying env var fallback"
            );
            set_field(root, mapping.field_path, coerce(mapping.kind, val));
            count = count.saturating_add(1);
        }
    }

    count
}

/// Collect all current environment variables into a map.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars().collect()
}

fn field_is_set(root: &toml::Value, path: &str) -> bool {
    let mut current = root;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return false,
        }
    }
    true
}

fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let (parents, leaf) = path.rsplit_once('.').unwrap_or(("", path));

    let mut current = root;
    for segment in parents.split('.').filter(|s| !s.is_empty()) {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        current = table
            .entry(segment)
            .or_insert(toml::Value::Table(toml::map::Map::new()));
    }

    if let Some(table) = current.as_table_mut() {
        table.insert(leaf.to_owned(), value);
    }
}

fn coerce(kind: ValueKind, val: &str) -> toml::Value {
    match kind {
        ValueKind::Integer => val
            .trim()
            .parse::<i64>()
            .map_or_else(|_| toml::Value::String(val.to_owned()), toml::Value::Integer),
        ValueKind::Boolean => val
            .trim()
            .parse::<bool>()
            .map_or_else(|_| toml::Value::String(val.to_owned()), toml::Value::Boolean),
        ValueKind::String => toml::Value::String(val.to_owned()),
    }
}
