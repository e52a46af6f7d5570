//! Bridge from `tether_config::Config` to the runtime's own types.
//!
//! The plugin crate does not depend on the config crate, so the conversion
//! happens here at startup.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tether_config::Config;
use tether_plugins::{Backends, HttpNetworkBackend, RuntimeConfig, SandboxConfig};
use tether_telemetry::{LogConfig, LogFormat};

/// Convert config to [`RuntimeConfig`].
///
/// A relative plugin directory is resolved against `workspace_root`.
pub(crate) fn to_runtime_config(cfg: &Config, workspace_root: Option<&Path>) -> RuntimeConfig {
    let plugin_dir = match workspace_root {
        Some(root) if cfg.plugins.directory.is_relative() => root.join(&cfg.plugins.directory),
        _ => cfg.plugins.directory.clone(),
    };

    RuntimeConfig {
        plugin_dir,
        sandbox: SandboxConfig {
            memory_limit_mb: cfg.sandbox.memory_limit_mb,
            timeout: Duration::from_millis(cfg.sandbox.timeout_ms),
            max_stack_kb: cfg.sandbox.max_stack_kb,
        },
        requests_per_minute: cfg.rate_limit.requests_per_minute,
        hot_reload: cfg.plugins.hot_reload,
        debounce: Duration::from_millis(cfg.plugins.debounce_ms),
        allow_list: cfg.plugins.allow_list.clone(),
        block_list: cfg.plugins.block_list.clone(),
    }
}

/// Convert config to [`LogConfig`].
pub(crate) fn to_log_config(cfg: &Config) -> LogConfig {
    // Validation already rejected unknown formats.
    let format = cfg.logging.format.parse().unwrap_or(LogFormat::Compact);

    let mut log_config = LogConfig::new(&cfg.logging.level).with_format(format);
    for directive in &cfg.logging.directives {
        log_config = log_config.with_directive(directive);
    }
    log_config
}

/// In-memory sheets and drive, plus real outbound HTTP bounded by the
/// `[network]` limits.
///
/// # Errors
///
/// Fails if the HTTP client cannot be built.
pub(crate) fn build_backends(cfg: &Config) -> anyhow::Result<Backends> {
    let network = HttpNetworkBackend::new(
        Duration::from_secs(cfg.network.timeout_secs),
        usize::try_from(cfg.network.max_response_bytes).unwrap_or(usize::MAX),
    )
    .map_err(|e| anyhow::anyhow!("network backend: {e}"))?;
    Ok(Backends::in_memory().with_network(Arc::new(network)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_runtime_config_from_defaults() {
        let rc = to_runtime_config(&Config::default(), None);
        assert_eq!(rc.plugin_dir, PathBuf::from("plugins"));
        assert_eq!(rc.sandbox, SandboxConfig::default());
        assert_eq!(rc.requests_per_minute, 60);
        assert!(rc.hot_reload);
        assert_eq!(rc.debounce, Duration::from_millis(300));
    }

    #[test]
    fn test_relative_plugin_dir_joins_workspace() {
        let mut cfg = Config::default();
        let rc = to_runtime_config(&cfg, Some(Path::new("/srv/app")));
        assert_eq!(rc.plugin_dir, PathBuf::from("/srv/app/plugins"));

        cfg.plugins.directory = PathBuf::from("/opt/plugins");
        let rc = to_runtime_config(&cfg, Some(Path::new("/srv/app")));
        assert_eq!(rc.plugin_dir, PathBuf::from("/opt/plugins"));
    }

    #[test]
    fn test_lists_and_ceilings_carry_over() {
        let mut cfg = Config::default();
        cfg.plugins.allow_list = vec!["a".into()];
        cfg.plugins.block_list = vec!["b".into()];
        cfg.sandbox.timeout_ms = 250;
        cfg.sandbox.memory_limit_mb = 16;
        cfg.rate_limit.requests_per_minute = 5;

        let rc = to_runtime_config(&cfg, None);
        assert_eq!(rc.allow_list, vec!["a".to_owned()]);
        assert_eq!(rc.block_list, vec!["b".to_owned()]);
        assert_eq!(rc.sandbox.timeout, Duration::from_millis(250));
        assert_eq!(rc.sandbox.memory_limit_mb, 16);
        assert_eq!(rc.requests_per_minute, 5);
    }

    #[test]
    fn test_log_config() {
        let mut cfg = Config::default();
        cfg.logging.level = "debug".into();
        cfg.logging.format = "json".into();
        cfg.logging.directives = vec!["tether_plugins=trace".into()];

        let lc = to_log_config(&cfg);
        assert_eq!(lc.level, "debug");
        assert_eq!(lc.format, LogFormat::Json);
        assert_eq!(lc.directives, vec!["tether_plugins=trace".to_owned()]);
    }

    #[test]
    fn test_backends_include_network() {
        let backends = build_backends(&Config::default()).unwrap();
        assert!(backends.sheets.is_some());
        assert!(backends.drive.is_some());
        assert!(backends.network.is_some());
    }
}
