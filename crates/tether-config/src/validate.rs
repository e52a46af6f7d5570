//! Post-merge configuration validation.
//!
//! Validates that deserialized [`Config`](crate::Config) values are within
//! acceptable ranges and that cross-field invariants hold.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Upper bound for the per-invocation wall-clock ceiling (ten minutes).
const MAX_TIMEOUT_MS: u64 = 600_000;

/// Upper bound for the per-invocation memory ceiling.
const MAX_MEMORY_LIMIT_MB: u64 = 4096;

/// Validate a fully-merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_plugins(config)?;
    validate_sandbox(config)?;
    validate_rate_limit(config)?;
    validate_network(config)?;
    validate_logging(config)?;
    Ok(())
}

fn validate_plugins(config: &Config) -> ConfigResult<()> {
    let p = &config.plugins;

    if p.directory.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError {
            field: "plugins.directory".to_owned(),
            message: "plugin directory must not be empty".to_owned(),
        });
    }

    if let Some(name) = p.allow_list.iter().find(|n| p.block_list.contains(n)) {
        return Err(ConfigError::ValidationError {
            field: "plugins.block_list".to_owned(),
            message: format!("plugin '{name}' is in both allow_list and block_list"),
        });
    }

    Ok(())
}

fn validate_sandbox(config: &Config) -> ConfigResult<()> {
    let s = &config.sandbox;

    if s.memory_limit_mb == 0 || s.memory_limit_mb > MAX_MEMORY_LIMIT_MB {
        return Err(ConfigError::ValidationError {
            field: "sandbox.memory_limit_mb".to_owned(),
            message: format!("memory_limit_mb must be between 1 and {MAX_MEMORY_LIMIT_MB}"),
        });
    }

    if s.timeout_ms == 0 || s.timeout_ms > MAX_TIMEOUT_MS {
        return Err(ConfigError::ValidationError {
            field: "sandbox.timeout_ms".to_owned(),
            message: format!("timeout_ms must be between 1 and {MAX_TIMEOUT_MS}"),
        });
    }

    if s.max_stack_kb == 0 {
        return Err(ConfigError::ValidationError {
            field: "sandbox.max_stack_kb".to_owned(),
            message: "max_stack_kb must be positive".to_owned(),
        });
    }

    Ok(())
}

fn validate_rate_limit(config: &Config) -> ConfigResult<()> {
    if config.rate_limit.requests_per_minute == 0 {
        return Err(ConfigError::ValidationError {
            field: "rate_limit.requests_per_minute".to_owned(),
            message: "requests_per_minute must be positive".to_owned(),
        });
    }
    Ok(())
}

fn validate_network(config: &Config) -> ConfigResult<()> {
    if config.network.timeout_secs == 0 {
        return Err(ConfigError::ValidationError {
            field: "network.timeout_secs".to_owned(),
            message: "timeout_secs must be positive".to_owned(),
        });
    }
    if config.network.max_response_bytes == 0 {
        return Err(ConfigError::ValidationError {
            field: "network.max_response_bytes".to_owned(),
            message: "max_response_bytes must be positive".to_owned(),
        });
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "logging.level".to_owned(),
            message: format!(
                "unsupported log level '{}'; expected one of: {}",
                config.logging.level,
                valid_levels.join(", ")
            ),
        });
    }

    let valid_formats = ["pretty", "compact", "json", "full"];
    if !valid_formats.contains(&config.logging.format.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "logging.format".to_owned(),
            message: format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                valid_formats.join(", ")
            ),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.sandbox.timeout_ms = 0;
        let err = validate(&config).unwrap_err();
        assert!(
            matches!(err, ConfigError::ValidationError { ref field, .. } if field == "sandbox.timeout_ms")
        );
    }

    #[test]
    fn test_excessive_timeout_rejected() {
        let mut config = Config::default();
        config.sandbox.timeout_ms = MAX_TIMEOUT_MS + 1;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_memory_rejected() {
        let mut config = Config::default();
        config.sandbox.memory_limit_mb = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_quota_rejected() {
        let mut config = Config::default();
        config.rate_limit.requests_per_minute = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_allow_and_block_overlap_rejected() {
        let mut config = Config::default();
        config.plugins.allow_list = vec!["a".into(), "b".into()];
        config.plugins.block_list = vec!["b".into()];
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "loud".to_owned();
        assert!(validate(&config).is_err());
    }
}
