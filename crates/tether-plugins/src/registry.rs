//! Plugin registry.
//!
//! Owns the set of loaded plugins keyed by manifest name. Lookups hand out
//! `Arc<LoadedPlugin>` snapshots, so a reload swaps the map entry without
//! disturbing callers that already hold the previous definition.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::discovery::{DiscoveredPlugin, discover_manifests, load_manifest, resolve_manifest_path};
use crate::error::{PluginError, PluginResult};
use crate::manifest::MANIFEST_FILE_NAME;
use crate::plugin::LoadedPlugin;

/// Registry of loaded plugins.
#[derive(Debug)]
pub struct PluginRegistry {
    plugin_dir: PathBuf,
    plugins: RwLock<HashMap<String, Arc<LoadedPlugin>>>,
}

impl PluginRegistry {
    /// Create an empty registry that discovers plugins under `plugin_dir`.
    #[must_use]
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// The directory scanned by [`discover_plugins`](Self::discover_plugins).
    #[must_use]
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    /// Parse and register the plugin at `path` (a plugin directory or its
    /// `plugin.toml`). The new plugin starts with a bare context.
    ///
    /// # Errors
    ///
    /// - [`PluginError::InvalidManifest`] / [`PluginError::LoadFailed`] if the
    ///   manifest or a handler is unusable.
    /// - [`PluginError::AlreadyLoaded`] if the name is taken.
    pub fn load_plugin(&self, path: &Path) -> PluginResult<Arc<LoadedPlugin>> {
        let plugin = self.prepare(path)?;
        self.insert(plugin)
    }

    /// Parse the plugin at `path` without registering it, so the caller can
    /// vet it and attach a context before anything can look it up.
    ///
    /// # Errors
    ///
    /// Same as [`load_plugin`](Self::load_plugin).
    pub fn prepare(&self, path: &Path) -> PluginResult<LoadedPlugin> {
        let plugin = Self::parse(path)?;
        if self.is_loaded(plugin.name()) {
            return Err(PluginError::AlreadyLoaded(plugin.name().to_owned()));
        }
        Ok(plugin)
    }

    /// Register a prepared plugin.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::AlreadyLoaded`] if the name was taken in the
    /// meantime.
    pub fn insert(&self, plugin: LoadedPlugin) -> PluginResult<Arc<LoadedPlugin>> {
        let name = plugin.name().to_owned();

        let mut plugins = self.write();
        if plugins.contains_key(&name) {
            return Err(PluginError::AlreadyLoaded(name));
        }
        let plugin = Arc::new(plugin);
        plugins.insert(name.clone(), Arc::clone(&plugin));
        drop(plugins);

        info!(
            plugin = %name,
            version = %plugin.manifest().version,
            dir = %plugin.source_dir().display(),
            "Loaded plugin"
        );
        Ok(plugin)
    }

    /// Remove a plugin. In-flight executions keep their own snapshot and
    /// finish normally.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the plugin is not loaded.
    pub fn unload_plugin(&self, name: &str) -> PluginResult<Arc<LoadedPlugin>> {
        let removed = self
            .write()
            .remove(name)
            .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;
        info!(plugin = %name, "Unloaded plugin");
        Ok(removed)
    }

    /// Parse a fresh definition of a loaded plugin from its source directory
    /// without installing it.
    ///
    /// # Errors
    ///
    /// - [`PluginError::NotFound`] if the plugin is not loaded.
    /// - Any load error from parsing, or [`PluginError::InvalidManifest`] if
    ///   the manifest now declares a different name.
    pub fn prepare_reload(&self, name: &str) -> PluginResult<LoadedPlugin> {
        let current = self
            .get_plugin(name)
            .ok_or_else(|| PluginError::NotFound(name.to_owned()))?;
        let dir = current.source_dir().to_path_buf();

        let fresh = Self::parse(&dir)?;
        if fresh.name() != name {
            return Err(PluginError::InvalidManifest {
                path: dir.join(MANIFEST_FILE_NAME),
                message: format!(
                    "manifest name changed from '{name}' to '{}'; unload and load it instead",
                    fresh.name()
                ),
            });
        }
        Ok(fresh)
    }

    /// Swap in a prepared definition. Lookups see either the old or the new
    /// definition, never a mix.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the plugin was unloaded while the
    /// replacement was being prepared.
    pub fn replace(&self, plugin: LoadedPlugin) -> PluginResult<Arc<LoadedPlugin>> {
        let name = plugin.name().to_owned();
        let plugin = Arc::new(plugin);

        let mut plugins = self.write();
        let Some(slot) = plugins.get_mut(&name) else {
            return Err(PluginError::NotFound(name));
        };
        *slot = Arc::clone(&plugin);
        drop(plugins);

        info!(plugin = %name, version = %plugin.manifest().version, "Reloaded plugin");
        Ok(plugin)
    }

    /// Re-parse a loaded plugin and swap it in. On failure the previous
    /// definition stays active.
    ///
    /// # Errors
    ///
    /// See [`prepare_reload`](Self::prepare_reload) and [`replace`](Self::replace).
    pub fn reload_plugin(&self, name: &str) -> PluginResult<Arc<LoadedPlugin>> {
        let fresh = self.prepare_reload(name).inspect_err(|e| {
            warn!(plugin = %name, error = %e, "Reload failed, keeping previous definition");
        })?;
        self.replace(fresh)
    }

    /// Scan the plugin directory for manifests without loading anything.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory exists but cannot be read.
    pub fn discover_plugins(&self) -> PluginResult<Vec<DiscoveredPlugin>> {
        discover_manifests(&self.plugin_dir)
    }

    /// Whether a plugin with this name is loaded.
    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// The current definition of a plugin, if loaded.
    #[must_use]
    pub fn get_plugin(&self, name: &str) -> Option<Arc<LoadedPlugin>> {
        self.read().get(name).cloned()
    }

    /// Every loaded plugin, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<Arc<LoadedPlugin>> {
        let mut plugins: Vec<_> = self.read().values().cloned().collect();
        plugins.sort_by(|a, b| a.name().cmp(b.name()));
        plugins
    }

    /// Number of loaded plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no plugins are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Unload every plugin, returning the names removed.
    pub fn shutdown(&self) -> Vec<String> {
        let names: Vec<String> = self.list().iter().map(|p| p.name().to_owned()).collect();
        let mut removed = Vec::with_capacity(names.len());
        for name in names {
            match self.unload_plugin(&name) {
                Ok(_) => removed.push(name),
                Err(e) => warn!(plugin = %name, error = %e, "Plugin unload error during shutdown"),
            }
        }
        debug!(count = removed.len(), "Registry shut down");
        removed
    }

    fn parse(path: &Path) -> PluginResult<LoadedPlugin> {
        let (manifest_path, dir) = resolve_manifest_path(path);
        let manifest = load_manifest(&manifest_path)?;
        LoadedPlugin::from_manifest(manifest, &dir)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<LoadedPlugin>>> {
        self.plugins.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<LoadedPlugin>>> {
        self.plugins.write().unwrap_or_else(PoisonError::into_inner)
    }
}
