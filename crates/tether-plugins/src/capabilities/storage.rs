//! Plugin-private key-value storage.
//!
//! One process-wide [`KvStore`] holds every plugin's entries under the
//! namespace `plugin:{name}:`. A [`StorageCapability`] is pre-bound to one
//! namespace, so plugins cannot see each other's keys. Entries live until
//! cleared or the process exits; unloading a plugin keeps them.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

/// Process-wide storage map.
#[derive(Debug, Default)]
pub struct KvStore {
    entries: DashMap<String, Value>,
}

impl KvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries across all namespaces.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Storage scoped to one plugin. Always granted and never rate limited.
#[derive(Debug, Clone)]
pub struct StorageCapability {
    prefix: String,
    store: Arc<KvStore>,
}

impl StorageCapability {
    pub(crate) fn new(plugin: impl AsRef<str>, store: Arc<KvStore>) -> Self {
        Self {
            prefix: format!("plugin:{}:", plugin.as_ref()),
            store,
        }
    }

    fn scoped(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    /// Read a value.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Value> {
        self.store.entries.get(&self.scoped(key)).map(|v| v.clone())
    }

    /// Write a value, replacing any previous one.
    pub fn set(&self, key: &str, value: Value) {
        self.store.entries.insert(self.scoped(key), value);
    }

    /// Remove a key. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        self.store.entries.remove(&self.scoped(key)).is_some()
    }

    /// This plugin's keys, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .store
            .entries
            .iter()
            .filter_map(|e| e.key().strip_prefix(&self.prefix).map(str::to_owned))
            .collect();
        keys.sort();
        keys
    }

    /// Remove every key in this plugin's namespace.
    pub fn clear(&self) {
        self.store
            .entries
            .retain(|key, _| !key.starts_with(&self.prefix));
    }
}
