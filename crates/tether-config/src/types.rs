//! Configuration types for the Tether runtime.
//!
//! Every struct implements [`Default`] with the same values as the embedded
//! `defaults.toml`, so a bare `[section]` header in TOML produces a working
//! configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root configuration for the Tether runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plugin location, hot reload, and allow/block lists.
    pub plugins: PluginsSection,
    /// Per-invocation sandbox ceilings.
    pub sandbox: SandboxSection,
    /// Per-plugin request quota.
    pub rate_limit: RateLimitSection,
    /// Outbound network capability limits.
    pub network: NetworkSection,
    /// Logging level, format, and per-crate directives.
    pub logging: LoggingSection,
}

// ---------------------------------------------------------------------------
// PluginsSection
// ---------------------------------------------------------------------------

/// Where plugins live and which of them may load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsSection {
    /// Directory scanned for plugin subdirectories containing `plugin.toml`.
    pub directory: PathBuf,
    /// Watch the plugin directory and reload plugins when their files change.
    pub hot_reload: bool,
    /// Debounce window for file change events, in milliseconds.
    pub debounce_ms: u64,
    /// If non-empty, only these plugin names may load.
    pub allow_list: Vec<String>,
    /// Plugin names that may never load.
    pub block_list: Vec<String>,
}

impl Default for PluginsSection {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("plugins"),
            hot_reload: true,
            debounce_ms: 300,
            allow_list: Vec::new(),
            block_list: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// SandboxSection
// ---------------------------------------------------------------------------

/// Resource ceilings applied to every handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Interpreter heap ceiling in megabytes.
    pub memory_limit_mb: u64,
    /// Wall-clock ceiling in milliseconds.
    pub timeout_ms: u64,
    /// Interpreter stack ceiling in kilobytes.
    pub max_stack_kb: u64,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            memory_limit_mb: 64,
            timeout_ms: 5000,
            max_stack_kb: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// RateLimitSection
// ---------------------------------------------------------------------------

/// Sliding-window quota shared by every capability of one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Maximum backend calls per plugin in any trailing 60 seconds.
    pub requests_per_minute: u32,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
        }
    }
}

// ---------------------------------------------------------------------------
// NetworkSection
// ---------------------------------------------------------------------------

/// Limits for the `network.fetch` capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSection {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Responses larger than this are rejected.
    pub max_response_bytes: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_response_bytes: 10 * 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// LoggingSection
// ---------------------------------------------------------------------------

/// Logging and tracing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Global log level filter (`"trace"`, `"debug"`, `"info"`, `"warn"`,
    /// `"error"`).
    pub level: String,
    /// Output format: `"pretty"` (human-friendly), `"compact"` (one-line),
    /// `"json"` (structured), or `"full"` (verbose).
    pub format: String,
    /// Per-crate tracing directives (e.g. `["tether_plugins=debug"]`).
    pub directives: Vec<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            format: "compact".to_owned(),
            directives: Vec::new(),
        }
    }
}
