//! Invocation context for correlating one handler execution.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation data for a single plugin handler invocation.
///
/// Every event logged while the invocation's span is entered (host side and
/// plugin `context.logger` calls alike) carries the invocation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationContext {
    /// Unique invocation identifier.
    pub invocation_id: Uuid,
    /// Plugin that owns the handler.
    pub plugin: String,
    /// Handler kind (`tool`, `resource`, `prompt`).
    pub kind: String,
    /// Handler name within the plugin.
    pub handler: String,
    /// When the invocation started.
    pub started_at: DateTime<Utc>,
    /// Additional metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InvocationContext {
    /// Create a context for invoking `handler` of the given `kind` on `plugin`.
    #[must_use]
    pub fn new(
        plugin: impl Into<String>,
        kind: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            plugin: plugin.into(),
            kind: kind.into(),
            handler: handler.into(),
            started_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Milliseconds since the invocation started.
    #[must_use]
    pub fn elapsed_ms(&self) -> i64 {
        // started_at is set at creation, so now >= started_at.
        #[allow(clippy::arithmetic_side_effects)]
        let elapsed = Utc::now() - self.started_at;
        elapsed.num_milliseconds()
    }

    /// Create a tracing span for this invocation.
    #[must_use]
    pub fn span(&self) -> tracing::Span {
        tracing::info_span!(
            "invocation",
            invocation_id = %self.invocation_id,
            plugin = %self.plugin,
            kind = %self.kind,
            handler = %self.handler,
        )
    }

    /// First eight characters of the invocation id, for terse log lines.
    #[must_use]
    pub fn short_id(&self) -> String {
        self.invocation_id.simple().to_string()[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_context_creation() {
        let ctx = InvocationContext::new("sheet-tools", "tool", "read_range");
        assert_eq!(ctx.plugin, "sheet-tools");
        assert_eq!(ctx.kind, "tool");
        assert_eq!(ctx.handler, "read_range");
        assert!(ctx.metadata.is_empty());
    }

    #[test]
    fn test_invocation_ids_are_unique() {
        let a = InvocationContext::new("p", "tool", "t");
        let b = InvocationContext::new("p", "tool", "t");
        assert_ne!(a.invocation_id, b.invocation_id);
    }

    #[test]
    fn test_with_metadata() {
        let ctx = InvocationContext::new("p", "prompt", "describe").with_metadata("caller", "cli");
        assert_eq!(ctx.metadata.get("caller"), Some(&"cli".to_string()));
    }

    #[test]
    fn test_elapsed() {
        let ctx = InvocationContext::new("p", "tool", "t");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(ctx.elapsed_ms() >= 10);
    }

    #[test]
    fn test_short_id() {
        let ctx = InvocationContext::new("p", "tool", "t");
        assert_eq!(ctx.short_id().len(), 8);
    }

    #[test]
    fn test_serialization() {
        let ctx = InvocationContext::new("p", "resource", "summary");
        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"kind\":\"resource\""));

        let parsed: InvocationContext = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.invocation_id, ctx.invocation_id);
    }
}
