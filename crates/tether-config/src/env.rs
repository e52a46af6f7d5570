//! Environment variable fallbacks.
//!
//! Env vars are **fallback**, not override: they only apply to fields that
//! no config file set.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources};

/// Expected TOML type of an env-mapped field.
#[derive(Debug, Clone, Copy)]
enum FieldKind {
    String,
    Integer,
    Bool,
}

/// Mapping from environment variable name to config field path.
struct EnvMapping {
    var_name: &'static str,
    field_path: &'static str,
    kind: FieldKind,
}

/// All supported `TETHER_*` env var mappings.
const ENV_MAPPINGS: &[EnvMapping] = &[
    EnvMapping {
        var_name: "TETHER_PLUGIN_DIR",
        field_path: "plugins.directory",
        kind: FieldKind::String,
    },
    EnvMapping {
        var_name: "TETHER_HOT_RELOAD",
        field_path: "plugins.hot_reload",
        kind: FieldKind::Bool,
    },
    EnvMapping {
        var_name: "TETHER_MEMORY_LIMIT_MB",
        field_path: "sandbox.memory_limit_mb",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "TETHER_TIMEOUT_MS",
        field_path: "sandbox.timeout_ms",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "TETHER_REQUESTS_PER_MINUTE",
        field_path: "rate_limit.requests_per_minute",
        kind: FieldKind::Integer,
    },
    EnvMapping {
        var_name: "TETHER_LOG_LEVEL",
        field_path: "logging.level",
        kind: FieldKind::String,
    },
    EnvMapping {
        var_name: "TETHER_LOG_FORMAT",
        field_path: "logging.format",
        kind: FieldKind::String,
    },
];

/// Every supported env var with the config field it falls back into.
#[must_use]
pub fn env_var_fields() -> Vec<(&'static str, &'static str)> {
    ENV_MAPPINGS
        .iter()
        .map(|m| (m.var_name, m.field_path))
        .collect()
}

/// Snapshot the process environment, keeping only `TETHER_*` variables.
#[must_use]
pub fn collect_env_vars() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with("TETHER_"))
        .collect()
}

/// Apply environment variable fallbacks to fields that were **not** set by
/// any config file layer.
///
/// Returns the number of env vars applied.
///
/// # Errors
///
/// Returns [`ConfigError::EnvError`] if a variable cannot be coerced to the
/// field's type (e.g. `TETHER_TIMEOUT_MS=soon`).
pub fn apply_env_fallbacks<S: ::std::hash::BuildHasher>(
    merged: &mut toml::Value,
    sources: &mut FieldSources,
    env_vars: &HashMap<String, String, S>,
) -> ConfigResult<usize> {
    let mut count: usize = 0;

    for mapping in ENV_MAPPINGS {
        if sources
            .get(mapping.field_path)
            .is_some_and(ConfigLayer::is_file)
        {
            continue;
        }

        if let Some(val) = env_vars.get(mapping.var_name) {
            debug!(
                var = mapping.var_name,
                field = mapping.field_path,
                "applying env var fallback"
            );

            let toml_val = coerce(mapping, val)?;
            set_field(merged, mapping.field_path, toml_val);
            sources.insert(mapping.field_path.to_owned(), ConfigLayer::Environment);
            count = count.saturating_add(1);
        }
    }

    Ok(count)
}

fn coerce(mapping: &EnvMapping, raw: &str) -> ConfigResult<toml::Value> {
    let raw = raw.trim();
    match mapping.kind {
        FieldKind::String => Ok(toml::Value::String(raw.to_owned())),
        FieldKind::Integer => {
            raw.parse::<i64>()
                .map(toml::Value::Integer)
                .map_err(|_| ConfigError::EnvError {
                    var_name: mapping.var_name.to_owned(),
                    message: format!("expected an integer, got '{raw}'"),
                })
        },
        FieldKind::Bool => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(toml::Value::Boolean(true)),
            "0" | "false" | "no" | "off" => Ok(toml::Value::Boolean(false)),
            _ => Err(ConfigError::EnvError {
                var_name: mapping.var_name.to_owned(),
                message: format!("expected a boolean, got '{raw}'"),
            }),
        },
    }
}

/// Insert `value` at a dotted `path`, creating intermediate tables.
fn set_field(root: &mut toml::Value, path: &str, value: toml::Value) {
    let mut segments: Vec<&str> = path.split('.').collect();
    let Some(leaf) = segments.pop() else {
        return;
    };

    let mut current = root;
    for segment in segments {
        let Some(table) = current.as_table_mut() else {
            return;
        };
        current = table
            .entry(segment)
            .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
    }

    if let Some(table) = current.as_table_mut() {
        table.insert(leaf.to_owned(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_env_fills_unset_field() {
        let mut merged: toml::Value = toml::from_str("[sandbox]\ntimeout_ms = 5000\n").unwrap();
        let mut sources = FieldSources::new();
        sources.insert("sandbox.timeout_ms".into(), ConfigLayer::Defaults);

        let count = apply_env_fallbacks(
            &mut merged,
            &mut sources,
            &env(&[("TETHER_TIMEOUT_MS", "250")]),
        )
        .unwrap();

        assert_eq!(count, 1);
        assert_eq!(merged["sandbox"]["timeout_ms"].as_integer(), Some(250));
        assert_eq!(
            sources.get("sandbox.timeout_ms"),
            Some(&ConfigLayer::Environment)
        );
    }

    #[test]
    fn test_env_does_not_override_file_value() {
        let mut merged: toml::Value = toml::from_str("[logging]\nlevel = \"warn\"\n").unwrap();
        let mut sources = FieldSources::new();
        sources.insert("logging.level".into(), ConfigLayer::User);

        let count = apply_env_fallbacks(
            &mut merged,
            &mut sources,
            &env(&[("TETHER_LOG_LEVEL", "trace")]),
        )
        .unwrap();

        assert_eq!(count, 0);
        assert_eq!(merged["logging"]["level"].as_str(), Some("warn"));
    }

    #[test]
    fn test_env_creates_missing_tables() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let mut sources = FieldSources::new();

        apply_env_fallbacks(
            &mut merged,
            &mut sources,
            &env(&[("TETHER_HOT_RELOAD", "off"), ("TETHER_PLUGIN_DIR", "/srv/plugins")]),
        )
        .unwrap();

        assert_eq!(merged["plugins"]["hot_reload"].as_bool(), Some(false));
        assert_eq!(merged["plugins"]["directory"].as_str(), Some("/srv/plugins"));
    }

    #[test]
    fn test_env_rejects_bad_integer() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let mut sources = FieldSources::new();

        let err = apply_env_fallbacks(
            &mut merged,
            &mut sources,
            &env(&[("TETHER_REQUESTS_PER_MINUTE", "lots")]),
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::EnvError { ref var_name, .. } if var_name == "TETHER_REQUESTS_PER_MINUTE"));
    }

    #[test]
    fn test_env_rejects_bad_bool() {
        let mut merged = toml::Value::Table(toml::map::Map::new());
        let mut sources = FieldSources::new();

        let result = apply_env_fallbacks(
            &mut merged,
            &mut sources,
            &env(&[("TETHER_HOT_RELOAD", "maybe")]),
        );
        assert!(result.is_err());
    }
}
