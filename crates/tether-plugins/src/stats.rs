//! Per-plugin invocation statistics.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Running counters for one plugin.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginStats {
    /// Handler invocations, successful or not.
    pub tool_calls: u64,
    /// Cumulative execution time.
    pub total_execution_time: Duration,
    /// `total_execution_time / tool_calls`, zero before the first call.
    pub average_execution_time: Duration,
    /// Invocations that returned an error.
    pub error_count: u64,
    /// When the last invocation finished.
    pub last_executed: Option<DateTime<Utc>>,
}

impl PluginStats {
    fn record(&mut self, elapsed: Duration, failed: bool) {
        self.tool_calls = self.tool_calls.saturating_add(1);
        self.total_execution_time = self.total_execution_time.saturating_add(elapsed);
        let calls = u32::try_from(self.tool_calls).unwrap_or(u32::MAX);
        self.average_execution_time = self
            .total_execution_time
            .checked_div(calls)
            .unwrap_or_default();
        if failed {
            self.error_count = self.error_count.saturating_add(1);
        }
        self.last_executed = Some(Utc::now());
    }
}

/// Stats for every loaded plugin. Each update holds that plugin's entry lock.
#[derive(Debug, Default)]
pub struct StatsTracker {
    entries: DashMap<String, PluginStats>,
}

impl StatsTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a zeroed entry, replacing any existing one.
    pub fn init(&self, plugin: &str) {
        self.entries.insert(plugin.to_owned(), PluginStats::default());
    }

    /// Record one finished invocation.
    ///
    /// Returns `false` if the plugin has no entry, which happens when a call
    /// finishes after its plugin was unloaded.
    pub fn record(&self, plugin: &str, elapsed: Duration, failed: bool) -> bool {
        match self.entries.get_mut(plugin) {
            Some(mut stats) => {
                stats.record(elapsed, failed);
                true
            },
            None => false,
        }
    }

    /// Snapshot of one plugin's stats.
    #[must_use]
    pub fn get(&self, plugin: &str) -> Option<PluginStats> {
        self.entries.get(plugin).map(|s| s.clone())
    }

    /// Snapshot of every plugin's stats, sorted by plugin name.
    #[must_use]
    pub fn all(&self) -> Vec<(String, PluginStats)> {
        let mut all: Vec<_> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drop a plugin's entry.
    pub fn remove(&self, plugin: &str) {
        self.entries.remove(plugin);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_zeroed() {
        let stats = StatsTracker::new();
        stats.init("p");
        assert_eq!(stats.get("p"), Some(PluginStats::default()));
        assert!(stats.get("other").is_none());
    }

    #[test]
    fn test_record_success_and_failure() {
        let stats = StatsTracker::new();
        stats.init("p");
        stats.record("p", Duration::from_millis(10), false);
        stats.record("p", Duration::from_millis(30), true);
        stats.record("p", Duration::from_millis(20), false);

        let s = stats.get("p").unwrap();
        assert_eq!(s.tool_calls, 3);
        assert_eq!(s.error_count, 1);
        assert_eq!(s.total_execution_time, Duration::from_millis(60));
        assert_eq!(s.average_execution_time, Duration::from_millis(20));
        assert!(s.last_executed.is_some());
    }

    #[test]
    fn test_init_replaces_existing() {
        let stats = StatsTracker::new();
        stats.init("p");
        stats.record("p", Duration::from_millis(5), true);
        stats.init("p");
        assert_eq!(stats.get("p").unwrap().tool_calls, 0);
    }

    #[test]
    fn test_record_without_entry_is_dropped() {
        let stats = StatsTracker::new();
        assert!(!stats.record("gone", Duration::from_millis(5), false));
        assert!(stats.get("gone").is_none());
    }

    #[test]
    fn test_all_sorted_and_remove() {
        let stats = StatsTracker::new();
        stats.init("b");
        stats.init("a");
        let names: Vec<_> = stats.all().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);

        stats.remove("a");
        assert!(stats.get("a").is_none());
        assert_eq!(stats.all().len(), 1);
    }
}
