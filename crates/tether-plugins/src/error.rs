//! Plugin error types.
//!
//! Every [`PluginError`] maps onto one of seven [`ErrorKind`]s. Callers branch
//! on the kind (and its stable [`code`](ErrorKind::code)) rather than on the
//! concrete variant.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::plugin::HandlerKind;

/// The coarse classification callers use for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Manifest malformed, unparsable, or otherwise unloadable.
    LoadError,
    /// Plugin or handler name unknown.
    NotFound,
    /// Allow/block-list rejection or a capability call without its grant.
    PermissionDenied,
    /// Rate limiter denial.
    QuotaExceeded,
    /// Sandbox wall-clock ceiling exceeded.
    Timeout,
    /// Sandbox memory ceiling exceeded.
    MemoryExceeded,
    /// Any other fault raised by plugin code or its backends.
    RuntimeError,
}

impl ErrorKind {
    /// Stable error code string.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::LoadError => "PLUGIN_LOAD_ERROR",
            Self::NotFound => "PLUGIN_NOT_FOUND",
            Self::PermissionDenied => "PLUGIN_PERMISSION_DENIED",
            Self::QuotaExceeded => "PLUGIN_QUOTA_EXCEEDED",
            Self::Timeout => "PLUGIN_TIMEOUT",
            Self::MemoryExceeded => "PLUGIN_MEMORY_EXCEEDED",
            Self::RuntimeError => "PLUGIN_RUNTIME_ERROR",
        }
    }

    /// Parse a stable error code back into a kind.
    #[must_use]
    pub fn from_code(code: &str) -> Option<Self> {
        [
            Self::LoadError,
            Self::NotFound,
            Self::PermissionDenied,
            Self::QuotaExceeded,
            Self::Timeout,
            Self::MemoryExceeded,
            Self::RuntimeError,
        ]
        .into_iter()
        .find(|k| k.code() == code)
    }

    /// Whether retrying after a backoff can plausibly succeed.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::QuotaExceeded | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Errors from plugin operations.
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    /// The manifest file could not be read, parsed, or validated.
    #[error("invalid manifest at {path}: {message}")]
    InvalidManifest {
        /// Path to the manifest file.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },

    /// A parsed plugin could not be loaded.
    #[error("plugin load failed: {plugin} - {message}")]
    LoadFailed {
        /// The plugin that failed to load.
        plugin: String,
        /// Failure reason.
        message: String,
    },

    /// A plugin with this name is already loaded.
    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(String),

    /// The requested plugin is not loaded.
    #[error("plugin not found: {0}")]
    NotFound(String),

    /// The plugin is loaded but has no handler with this name.
    #[error("{kind} not found in plugin {plugin}: {name}")]
    HandlerNotFound {
        /// The plugin that was searched.
        plugin: String,
        /// Which handler table was searched.
        kind: HandlerKind,
        /// The missing handler name.
        name: String,
    },

    /// The plugin was refused by the allow-list or block-list.
    #[error("plugin {plugin} rejected: {reason}")]
    Rejected {
        /// The rejected plugin.
        plugin: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A capability call was attempted without the required grant.
    #[error("plugin {plugin} lacks permission {permission}")]
    PermissionDenied {
        /// The calling plugin.
        plugin: String,
        /// The missing permission string (e.g. `sheets.write`).
        permission: String,
    },

    /// The plugin's per-minute request quota is exhausted.
    #[error("plugin {plugin} exceeded its request quota ({remaining} remaining)")]
    QuotaExceeded {
        /// The throttled plugin.
        plugin: String,
        /// Requests left in the current window.
        remaining: u32,
    },

    /// The handler ran past its wall-clock ceiling.
    #[error("plugin {plugin} timed out after {limit_ms} ms")]
    Timeout {
        /// The plugin whose handler timed out.
        plugin: String,
        /// The configured ceiling.
        limit_ms: u64,
    },

    /// The handler ran past its memory ceiling.
    #[error("plugin {plugin} exceeded its memory limit of {limit_mb} MB")]
    MemoryExceeded {
        /// The plugin whose handler ran out of memory.
        plugin: String,
        /// The configured ceiling.
        limit_mb: u64,
    },

    /// Plugin code raised an uncaught error (message already sanitized).
    #[error("plugin {plugin} failed: {message}")]
    Runtime {
        /// The failing plugin.
        plugin: String,
        /// Sanitized error message.
        message: String,
    },

    /// A backend call delegated by a capability failed.
    #[error("backend error for plugin {plugin}: {message}")]
    Backend {
        /// The calling plugin.
        plugin: String,
        /// The backend's error message.
        message: String,
    },

    /// Hot-reload watcher could not be started or failed.
    #[error("watcher error: {0}")]
    Watcher(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// The coarse kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidManifest { .. }
            | Self::LoadFailed { .. }
            | Self::AlreadyLoaded(_)
            | Self::Io(_) => ErrorKind::LoadError,
            Self::NotFound(_) | Self::HandlerNotFound { .. } => ErrorKind::NotFound,
            Self::Rejected { .. } | Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::MemoryExceeded { .. } => ErrorKind::MemoryExceeded,
            Self::Runtime { .. } | Self::Backend { .. } | Self::Watcher(_) => {
                ErrorKind::RuntimeError
            },
        }
    }

    /// The plugin this error concerns, if any.
    #[must_use]
    pub fn plugin(&self) -> Option<&str> {
        match self {
            Self::LoadFailed { plugin, .. }
            | Self::HandlerNotFound { plugin, .. }
            | Self::Rejected { plugin, .. }
            | Self::PermissionDenied { plugin, .. }
            | Self::QuotaExceeded { plugin, .. }
            | Self::Timeout { plugin, .. }
            | Self::MemoryExceeded { plugin, .. }
            | Self::Runtime { plugin, .. }
            | Self::Backend { plugin, .. } => Some(plugin),
            Self::AlreadyLoaded(plugin) | Self::NotFound(plugin) => Some(plugin),
            Self::InvalidManifest { .. } | Self::Watcher(_) | Self::Io(_) => None,
        }
    }

    /// Structured extra data for callers (e.g. remaining quota).
    #[must_use]
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::QuotaExceeded { remaining, .. } => Some(json!({ "remaining": remaining })),
            Self::PermissionDenied { permission, .. } => {
                Some(json!({ "permission": permission }))
            },
            Self::Timeout { limit_ms, .. } => Some(json!({ "limit_ms": limit_ms })),
            Self::MemoryExceeded { limit_mb, .. } => Some(json!({ "limit_mb": limit_mb })),
            Self::HandlerNotFound { kind, name, .. } => {
                Some(json!({ "handler_kind": kind.as_str(), "handler": name }))
            },
            _ => None,
        }
    }

    /// Flatten into the serializable shape returned to callers.
    #[must_use]
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            plugin: self.plugin().map(str::to_owned),
            details: self.details(),
        }
    }
}

/// Serializable error shape: kind, message, plugin name, optional details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Coarse error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Plugin the error concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    /// Structured details (remaining quota, missing permission, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Result type for plugin operations.
pub type PluginResult<T> = Result<T, PluginError>;
