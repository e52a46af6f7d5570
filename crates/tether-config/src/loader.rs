//! Config file discovery and layered loading.
//!
//! Implements the `Config::load()` algorithm:
//! 1. Parse `defaults.toml` → base
//! 2. Merge `~/.tether/config.toml` (user)
//! 3. Merge `{workspace}/.tether/config.toml` (workspace)
//! 4. Apply env var fallbacks for fields no file set
//! 5. Deserialize merged tree → `Config`
//! 6. Validate

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::env::{apply_env_fallbacks, collect_env_vars};
use crate::error::{ConfigError, ConfigResult};
use crate::merge::{ConfigLayer, FieldSources, deep_merge_tracking, record_leaves};
use crate::types::Config;
use crate::validate;

/// Embedded default configuration.
const DEFAULTS_TOML: &str = include_str!("defaults.toml");

/// Maximum allowed config file size (1 MB).
const MAX_CONFIG_FILE_SIZE: u64 = 1_048_576;

/// Name of the per-user and per-workspace config directory.
const CONFIG_DIR_NAME: &str = ".tether";

/// A fully resolved configuration plus where each value came from.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// The final configuration.
    pub config: Config,
    /// Which layer set each leaf field (dotted path → layer).
    pub field_sources: FieldSources,
    /// Config files that were found and merged, in merge order.
    pub loaded_files: Vec<String>,
}

impl ResolvedConfig {
    /// Config files consulted by [`load`], lowest precedence first.
    ///
    /// The user path is omitted when no home directory is known.
    #[must_use]
    pub fn config_paths(home: Option<&Path>, workspace: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(2);
        if let Some(home) = home {
            paths.push(home.join(CONFIG_DIR_NAME).join("config.toml"));
        }
        if let Some(ws) = workspace {
            paths.push(ws.join(CONFIG_DIR_NAME).join("config.toml"));
        }
        paths
    }

    /// Render the configuration as TOML or pretty JSON, optionally limited
    /// to one top-level section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for an unknown section or a
    /// serialization failure.
    pub fn render(&self, json: bool, section: Option<&str>) -> ConfigResult<String> {
        let render_err = |message: String| ConfigError::ValidationError {
            field: section.unwrap_or("<root>").to_owned(),
            message,
        };
        let mut value =
            serde_json::to_value(&self.config).map_err(|e| render_err(e.to_string()))?;
        if let Some(name) = section {
            let inner = value
                .get(name)
                .cloned()
                .ok_or_else(|| render_err(format!("unknown section '{name}'")))?;
            let mut only = serde_json::Map::new();
            only.insert(name.to_owned(), inner);
            value = serde_json::Value::Object(only);
        }
        if json {
            serde_json::to_string_pretty(&value).map_err(|e| render_err(e.to_string()))
        } else {
            toml::to_string_pretty(&value).map_err(|e| render_err(e.to_string()))
        }
    }

    /// Which layer set a dotted field path, if tracked.
    #[must_use]
    pub fn source_of(&self, field: &str) -> Option<&ConfigLayer> {
        self.field_sources.get(field)
    }
}

/// Load the configuration with layered file precedence.
///
/// `workspace_root` is the root of the current project. If `None`, the
/// workspace layer is skipped. `home_override` replaces the discovered home
/// directory and is treated as the `.tether` directory itself.
///
/// # Errors
///
/// Returns a [`ConfigError`] if any config file is malformed, an env var
/// cannot be coerced, or the final configuration fails validation.
pub fn load(workspace_root: Option<&Path>, home_override: Option<&Path>) -> ConfigResult<ResolvedConfig> {
    let env_vars = collect_env_vars();

    let mut merged: toml::Value =
        toml::from_str(DEFAULTS_TOML).map_err(|e| ConfigError::ParseError {
            path: "<embedded defaults>".to_owned(),
            source: e,
        })?;

    let mut field_sources = FieldSources::new();
    let mut loaded_files = Vec::new();
    record_leaves(&merged, "", &ConfigLayer::Defaults, &mut field_sources);

    // User config.
    let user_path = match home_override {
        Some(h) => h.join("config.toml"),
        None => home_directory()?.join(CONFIG_DIR_NAME).join("config.toml"),
    };
    if let Some(overlay) = try_load_file(&user_path)? {
        deep_merge_tracking(
            &mut merged,
            &overlay,
            "",
            &ConfigLayer::User,
            &mut field_sources,
        );
        loaded_files.push(user_path.display().to_string());
        info!(path = %user_path.display(), "loaded user config");
    }

    // Workspace config.
    if let Some(ws_root) = workspace_root {
        let ws_path = ws_root.join(CONFIG_DIR_NAME).join("config.toml");
        if let Some(overlay) = try_load_file(&ws_path)? {
            deep_merge_tracking(
                &mut merged,
                &overlay,
                "",
                &ConfigLayer::Workspace,
                &mut field_sources,
            );
            loaded_files.push(ws_path.display().to_string());
            info!(path = %ws_path.display(), "loaded workspace config");
        }
    }

    let env_count = apply_env_fallbacks(&mut merged, &mut field_sources, &env_vars)?;
    if env_count > 0 {
        debug!(count = env_count, "applied environment variable fallbacks");
    }

    let config: Config =
        merged
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::ParseError {
                path: "<merged config>".to_owned(),
                source: e,
            })?;

    validate::validate(&config)?;

    Ok(ResolvedConfig {
        config,
        field_sources,
        loaded_files,
    })
}

/// Load a config from a specific file path (no layering).
///
/// # Errors
///
/// Returns a [`ConfigError`] if the file cannot be read or parsed.
pub fn load_file(path: &Path) -> ConfigResult<Config> {
    let metadata = std::fs::metadata(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(oversized(path, metadata.len()));
    }

    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        source: e,
    })?;

    let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    validate::validate(&config)?;
    Ok(config)
}

/// Try to load a file, returning `None` if the file doesn't exist.
///
/// Uses a single read operation to avoid TOCTOU races (no separate
/// exists/metadata checks before reading).
fn try_load_file(path: &Path) -> ConfigResult<Option<toml::Value>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "config file not found, skipping");
            return Ok(None);
        },
        Err(e) => {
            return Err(ConfigError::ReadError {
                path: path.display().to_string(),
                source: e,
            });
        },
    };

    if content.len() as u64 > MAX_CONFIG_FILE_SIZE {
        return Err(oversized(path, content.len() as u64));
    }

    let value: toml::Value = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(Some(value))
}

fn oversized(path: &Path, len: u64) -> ConfigError {
    ConfigError::ValidationError {
        field: path.display().to_string(),
        message: format!("config file is {len} bytes, exceeding the {MAX_CONFIG_FILE_SIZE} byte limit"),
    }
}

/// Determine the user's home directory.
fn home_directory() -> ConfigResult<PathBuf> {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .ok_or(ConfigError::NoHomeDir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_parse() {
        let val: toml::Value = toml::from_str(DEFAULTS_TOML).unwrap();
        let table = val.as_table().unwrap();
        assert!(table.contains_key("plugins"));
        assert!(table.contains_key("sandbox"));
        assert!(table.contains_key("rate_limit"));
    }

    #[test]
    fn test_defaults_match_default_impl() {
        let from_toml: Config = toml::from_str(DEFAULTS_TOML).unwrap();
        let from_impl = Config::default();
        assert_eq!(from_toml.sandbox.timeout_ms, from_impl.sandbox.timeout_ms);
        assert_eq!(
            from_toml.sandbox.memory_limit_mb,
            from_impl.sandbox.memory_limit_mb
        );
        assert_eq!(
            from_toml.rate_limit.requests_per_minute,
            from_impl.rate_limit.requests_per_minute
        );
        assert_eq!(from_toml.plugins.directory, from_impl.plugins.directory);
        assert_eq!(
            from_toml.network.max_response_bytes,
            from_impl.network.max_response_bytes
        );
    }

    #[test]
    fn test_load_file_nonexistent() {
        let result = load_file(Path::new("/nonexistent/config.toml"));
        assert!(matches!(result, Err(ConfigError::ReadError { .. })));
    }

    #[test]
    fn test_try_load_file_missing() {
        let result = try_load_file(Path::new("/nonexistent/config.toml")).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_load_file_partial_sections_use_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sandbox]\ntimeout_ms = 250\n").unwrap();

        let config = load_file(&path).unwrap();
        assert_eq!(config.sandbox.timeout_ms, 250);
        assert_eq!(config.sandbox.memory_limit_mb, 64);
        assert_eq!(config.rate_limit.requests_per_minute, 60);
    }

    #[test]
    fn test_load_file_rejects_invalid_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[rate_limit]\nrequests_per_minute = 0\n").unwrap();

        assert!(matches!(
            load_file(&path),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_config_paths_order() {
        let paths = ResolvedConfig::config_paths(Some(Path::new("/home/u")), Some(Path::new("/ws")));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/u/.tether/config.toml"),
                PathBuf::from("/ws/.tether/config.toml"),
            ]
        );
        assert_eq!(ResolvedConfig::config_paths(None, None), Vec::<PathBuf>::new());
    }

    #[test]
    fn test_render_section() {
        let home = TempDir::new().unwrap();
        let resolved = load(None, Some(home.path())).unwrap();

        let toml_out = resolved.render(false, Some("sandbox")).unwrap();
        assert!(toml_out.contains("[sandbox]"));
        assert!(toml_out.contains("timeout_ms = 5000"));
        assert!(!toml_out.contains("[logging]"));

        let json_out = resolved.render(true, None).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json_out).unwrap();
        assert_eq!(parsed["rate_limit"]["requests_per_minute"], 60);

        assert!(resolved.render(false, Some("nope")).is_err());
        assert_eq!(
            resolved.source_of("sandbox.timeout_ms"),
            Some(&ConfigLayer::Defaults)
        );
    }

    #[test]
    fn test_load_file_rejects_malformed_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sandbox\ntimeout_ms = ").unwrap();

        assert!(matches!(load_file(&path), Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_layered_load_workspace_wins_over_user() {
        let home = TempDir::new().unwrap();
        std::fs::write(
            home.path().join("config.toml"),
            "[sandbox]\ntimeout_ms = 1000\nmemory_limit_mb = 32\n",
        )
        .unwrap();

        let ws = TempDir::new().unwrap();
        std::fs::create_dir(ws.path().join(".tether")).unwrap();
        std::fs::write(
            ws.path().join(".tether").join("config.toml"),
            "[sandbox]\ntimeout_ms = 2000\n",
        )
        .unwrap();

        let resolved = load(Some(ws.path()), Some(home.path())).unwrap();
        assert_eq!(resolved.config.sandbox.timeout_ms, 2000);
        assert_eq!(resolved.config.sandbox.memory_limit_mb, 32);
        assert_eq!(resolved.loaded_files.len(), 2);
        assert_eq!(
            resolved.field_sources.get("sandbox.timeout_ms"),
            Some(&ConfigLayer::Workspace)
        );
        assert_eq!(
            resolved.field_sources.get("sandbox.memory_limit_mb"),
            Some(&ConfigLayer::User)
        );
    }

    #[test]
    fn test_layered_load_without_files_uses_defaults() {
        let home = TempDir::new().unwrap();
        let resolved = load(None, Some(home.path())).unwrap();
        assert!(resolved.loaded_files.is_empty());
        assert!(resolved.config.plugins.hot_reload);
    }
}
