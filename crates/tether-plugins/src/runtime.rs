//! Plugin runtime: the façade the host talks to.
//!
//! Wires the registry, capability factory, sandbox, rate limiter, stats and
//! hot-reload coordinator together. Lifecycle operations (load, unload,
//! reload) are synchronous and cheap; handler execution is async and bounded
//! by the sandbox ceilings.

use std::path::{Path, PathBuf};
use std::sync::Arc;
#[cfg(feature = "watch")]
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tether_telemetry::InvocationContext;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, info, warn};

use crate::backend::Backends;
use crate::capabilities::{CapabilityFactory, KvStore};
use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::plugin::{HandlerKind, LoadedPlugin, PluginSummary};
use crate::rate_limit::RateLimiter;
use crate::registry::PluginRegistry;
use crate::sandbox::{Bindings, HostContext, Sandbox, SandboxConfig};
use crate::stats::{PluginStats, StatsTracker};
#[cfg(feature = "watch")]
use crate::watcher::{HotReloadCoordinator, WatchEvent, WatcherConfig};

/// Capacity of the runtime event broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory whose subdirectories are plugins.
    pub plugin_dir: PathBuf,
    /// Per-invocation ceilings.
    pub sandbox: SandboxConfig,
    /// Per-plugin capability calls allowed in any 60 s window.
    pub requests_per_minute: u32,
    /// Whether [`PluginRuntime::start_hot_reload`] should watch at all.
    pub hot_reload: bool,
    /// Debounce for file change events.
    pub debounce: Duration,
    /// If non-empty, only these plugin names may load.
    pub allow_list: Vec<String>,
    /// Plugin names that may never load.
    pub block_list: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            plugin_dir: PathBuf::from("plugins"),
            sandbox: SandboxConfig::default(),
            requests_per_minute: 60,
            hot_reload: true,
            debounce: Duration::from_millis(300),
            allow_list: Vec::new(),
            block_list: Vec::new(),
        }
    }
}

/// Lifecycle notifications published by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// A plugin was loaded and wired.
    PluginLoaded {
        /// Plugin name.
        name: String,
    },
    /// A plugin was unloaded.
    PluginUnloaded {
        /// Plugin name.
        name: String,
    },
    /// A plugin definition was replaced.
    PluginReloaded {
        /// Plugin name.
        name: String,
    },
    /// A background operation failed.
    Error {
        /// Plugin involved, if known.
        plugin: Option<String>,
        /// What went wrong.
        message: String,
    },
}

/// Result of loading one discovered plugin in [`PluginRuntime::load_all`].
#[derive(Debug)]
pub struct LoadOutcome {
    /// Plugin directory.
    pub dir: PathBuf,
    /// Manifest name, if the manifest parsed.
    pub name: Option<String>,
    /// The loaded plugin, or why it did not load.
    pub result: PluginResult<Arc<LoadedPlugin>>,
}

/// The plugin runtime. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct PluginRuntime {
    inner: Arc<Inner>,
}

struct Inner {
    config: RuntimeConfig,
    registry: PluginRegistry,
    factory: CapabilityFactory,
    sandbox: Sandbox,
    stats: StatsTracker,
    events: broadcast::Sender<RuntimeEvent>,
    #[cfg(feature = "watch")]
    hot_reload: Mutex<Option<HotReload>>,
}

#[cfg(feature = "watch")]
struct HotReload {
    coordinator: HotReloadCoordinator,
    consumer: tokio::task::JoinHandle<()>,
}

impl PluginRuntime {
    /// Create a runtime over the given backends.
    #[must_use]
    pub fn new(config: RuntimeConfig, backends: Backends) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.requests_per_minute));
        let factory = CapabilityFactory::new(limiter, backends, Arc::new(KvStore::new()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!(
            plugin_dir = %config.plugin_dir.display(),
            memory_limit_mb = config.sandbox.memory_limit_mb,
            timeout_ms = config.sandbox.timeout.as_millis(),
            requests_per_minute = config.requests_per_minute,
            "Plugin runtime created"
        );

        Self {
            inner: Arc::new(Inner {
                registry: PluginRegistry::new(config.plugin_dir.clone()),
                sandbox: Sandbox::new(config.sandbox.clone()),
                factory,
                stats: StatsTracker::new(),
                events,
                #[cfg(feature = "watch")]
                hot_reload: Mutex::new(None),
                config,
            }),
        }
    }

    /// The runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// The underlying registry.
    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.inner.registry
    }

    /// The shared rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        self.inner.factory.limiter()
    }

    /// The sandbox handler code runs in.
    #[must_use]
    pub fn sandbox(&self) -> &Sandbox {
        &self.inner.sandbox
    }

    /// Receive lifecycle events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    /// Load the plugin at `path`, apply the allow/block lists and dependency
    /// check, attach capabilities, and start fresh stats.
    ///
    /// # Errors
    ///
    /// - Any registry load error.
    /// - [`PluginError::Rejected`] (permission denied) for list rejections.
    /// - [`PluginError::LoadFailed`] for a missing dependency.
    ///
    /// The plugin only becomes visible to lookups once it has been admitted
    /// and its capabilities are attached.
    pub fn load_plugin(&self, path: &Path) -> PluginResult<Arc<LoadedPlugin>> {
        let inner = &self.inner;
        let prepared = inner.registry.prepare(path).inspect_err(|e| {
            warn!(path = %path.display(), error = %e, "Plugin failed to load");
        })?;
        let name = prepared.name().to_owned();

        if let Err(e) = self.admit(prepared.manifest()) {
            warn!(plugin = %name, error = %e, "Plugin rejected");
            return Err(e);
        }

        prepared.attach_context(inner.factory.build(prepared.manifest()));
        let plugin = inner.registry.insert(prepared)?;
        inner.stats.init(&name);
        self.emit(RuntimeEvent::PluginLoaded { name });
        Ok(plugin)
    }

    /// Unload a plugin, clearing its quota window and stats.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::NotFound`] if the plugin is not loaded.
    pub fn unload_plugin(&self, name: &str) -> PluginResult<()> {
        let inner = &self.inner;
        inner.registry.unload_plugin(name)?;
        inner.factory.limiter().reset_quota(name);
        inner.stats.remove(name);

        let dependents: Vec<String> = inner
            .registry
            .list()
            .iter()
            .filter(|p| p.manifest().dependencies.iter().any(|d| d == name))
            .map(|p| p.name().to_owned())
            .collect();
        if !dependents.is_empty() {
            warn!(plugin = %name, ?dependents, "Unloaded a plugin other loaded plugins depend on");
        }

        self.emit(RuntimeEvent::PluginUnloaded {
            name: name.to_owned(),
        });
        Ok(())
    }

    /// Re-read a loaded plugin from disk and swap it in with a freshly
    /// derived context. Quota window and stats carry over.
    ///
    /// # Errors
    ///
    /// Any load or admission error; the previous definition stays active.
    pub fn reload_plugin(&self, name: &str) -> PluginResult<Arc<LoadedPlugin>> {
        let inner = &self.inner;
        let result = inner.registry.prepare_reload(name).and_then(|fresh| {
            self.admit(fresh.manifest())?;
            fresh.attach_context(inner.factory.build(fresh.manifest()));
            inner.registry.replace(fresh)
        });

        match result {
            Ok(plugin) => {
                self.emit(RuntimeEvent::PluginReloaded {
                    name: name.to_owned(),
                });
                Ok(plugin)
            },
            Err(e) => {
                warn!(plugin = %name, error = %e, "Reload failed, keeping previous definition");
                self.emit(RuntimeEvent::Error {
                    plugin: Some(name.to_owned()),
                    message: e.to_string(),
                });
                Err(e)
            },
        }
    }

    /// Discover and load every plugin under the plugin directory, loading
    /// dependencies before their dependents. Failures are reported per
    /// plugin and never abort the batch.
    ///
    /// # Errors
    ///
    /// Returns an I/O error only if the plugin directory cannot be read.
    pub fn load_all(&self) -> PluginResult<Vec<LoadOutcome>> {
        let discovered = self.inner.registry.discover_plugins()?;
        let mut outcomes = Vec::with_capacity(discovered.len());
        let mut pending = Vec::new();

        for plugin in discovered {
            match plugin.manifest {
                Ok(manifest) => pending.push((plugin.dir, manifest)),
                Err(e) => outcomes.push(LoadOutcome {
                    dir: plugin.dir,
                    name: None,
                    result: Err(e),
                }),
            }
        }

        for (dir, manifest) in dependency_order(pending) {
            let result = self.load_plugin(&dir);
            outcomes.push(LoadOutcome {
                dir,
                name: Some(manifest.name),
                result,
            });
        }

        let loaded = outcomes.iter().filter(|o| o.result.is_ok()).count();
        info!(
            loaded,
            failed = outcomes.len().saturating_sub(loaded),
            "Loaded plugins from directory"
        );
        Ok(outcomes)
    }

    /// Run a tool handler.
    ///
    /// # Errors
    ///
    /// [`PluginError::NotFound`] / [`PluginError::HandlerNotFound`] for
    /// unknown names, otherwise whatever the sandboxed call failed with.
    pub async fn execute_tool_handler(
        &self,
        plugin: &str,
        tool: &str,
        params: Value,
    ) -> PluginResult<Value> {
        self.execute_handler(HandlerKind::Tool, plugin, tool, params)
            .await
    }

    /// Run a resource handler.
    ///
    /// # Errors
    ///
    /// See [`execute_tool_handler`](Self::execute_tool_handler).
    pub async fn execute_resource_handler(
        &self,
        plugin: &str,
        resource: &str,
        params: Value,
    ) -> PluginResult<Value> {
        self.execute_handler(HandlerKind::Resource, plugin, resource, params)
            .await
    }

    /// Run a prompt handler.
    ///
    /// # Errors
    ///
    /// See [`execute_tool_handler`](Self::execute_tool_handler).
    pub async fn execute_prompt_handler(
        &self,
        plugin: &str,
        prompt: &str,
        params: Value,
    ) -> PluginResult<Value> {
        self.execute_handler(HandlerKind::Prompt, plugin, prompt, params)
            .await
    }

    /// Run any handler. Stats are updated whether the call succeeds or not;
    /// errors are returned unchanged.
    ///
    /// # Errors
    ///
    /// See [`execute_tool_handler`](Self::execute_tool_handler).
    pub async fn execute_handler(
        &self,
        kind: HandlerKind,
        plugin: &str,
        name: &str,
        params: Value,
    ) -> PluginResult<Value> {
        let inner = &self.inner;
        let loaded = inner
            .registry
            .get_plugin(plugin)
            .ok_or_else(|| PluginError::NotFound(plugin.to_owned()))?;
        let handler = loaded
            .handler(kind, name)
            .ok_or_else(|| PluginError::HandlerNotFound {
                plugin: plugin.to_owned(),
                kind,
                name: name.to_owned(),
            })?;

        let invocation = InvocationContext::new(plugin, kind.as_str(), name);
        let span = invocation.span();
        let context: Arc<dyn HostContext> = loaded.context();

        async {
            debug!(source = %handler.handler.source(), "Executing handler");
            let started = Instant::now();
            let result = inner
                .sandbox
                .execute(handler.handler.invocable(), Bindings { params, context })
                .await;
            let elapsed = started.elapsed();

            if !inner.stats.record(plugin, elapsed, result.is_err()) {
                debug!("plugin unloaded during call, stats not recorded");
            }
            match &result {
                Ok(_) => info!(elapsed_ms = elapsed.as_millis(), "Handler completed"),
                Err(e) => warn!(
                    elapsed_ms = elapsed.as_millis(),
                    code = e.kind().code(),
                    error = %e,
                    "Handler failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Stats for one plugin.
    #[must_use]
    pub fn get_plugin_stats(&self, name: &str) -> Option<PluginStats> {
        self.inner.stats.get(name)
    }

    /// Stats for every loaded plugin, sorted by name.
    #[must_use]
    pub fn get_all_stats(&self) -> Vec<(String, PluginStats)> {
        self.inner.stats.all()
    }

    /// Summaries of every loaded plugin, sorted by name.
    #[must_use]
    pub fn list_plugins(&self) -> Vec<PluginSummary> {
        self.inner
            .registry
            .list()
            .iter()
            .map(|p| p.summary())
            .collect()
    }

    /// Start watching the plugin directory and applying reload/unload
    /// intents. Failure to start is logged and published as
    /// [`RuntimeEvent::Error`]; plugins can still be loaded manually.
    ///
    /// Returns whether the watcher is running.
    #[cfg(feature = "watch")]
    pub fn start_hot_reload(&self) -> bool {
        if !self.inner.config.hot_reload {
            debug!("Hot reload disabled by configuration");
            return false;
        }
        let mut slot = self
            .inner
            .hot_reload
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return true;
        }

        let coordinator = HotReloadCoordinator::new(WatcherConfig {
            root: self.inner.config.plugin_dir.clone(),
            debounce: self.inner.config.debounce,
        });
        let mut rx = match coordinator.watch() {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "Hot reload unavailable; plugins can still be loaded manually");
                self.emit(RuntimeEvent::Error {
                    plugin: None,
                    message: e.to_string(),
                });
                return false;
            },
        };

        let runtime = self.clone();
        let consumer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                runtime.apply_watch_event(event);
            }
            debug!("Hot-reload event stream ended");
        });
        *slot = Some(HotReload {
            coordinator,
            consumer,
        });
        true
    }

    /// Hot reload is compiled out without the `watch` feature.
    #[cfg(not(feature = "watch"))]
    pub fn start_hot_reload(&self) -> bool {
        warn!("Hot reload requested but the `watch` feature is disabled");
        false
    }

    /// Apply one watcher intent. Failures are logged and published, never
    /// returned.
    #[cfg(feature = "watch")]
    pub fn apply_watch_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::Reload { name, plugin_dir } => {
                if self.inner.registry.is_loaded(&name) {
                    // Errors are already logged and published by reload_plugin.
                    let _ = self.reload_plugin(&name);
                } else {
                    self.load_appeared(&name, &plugin_dir);
                }
            },
            WatchEvent::Unload { name, .. } => {
                if self.inner.registry.is_loaded(&name) {
                    if let Err(e) = self.unload_plugin(&name) {
                        self.report(Some(&name), &e);
                    }
                } else {
                    debug!(plugin = %name, "Unload event for a plugin that is not loaded");
                }
            },
            WatchEvent::Error(message) => {
                warn!(error = %message, "Hot-reload watcher reported an error");
                self.emit(RuntimeEvent::Error {
                    plugin: None,
                    message,
                });
            },
        }
    }

    /// Stop intake, unload everything, then destroy the sandbox. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;

        #[cfg(feature = "watch")]
        {
            let hot_reload = inner
                .hot_reload
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(hot_reload) = hot_reload {
                hot_reload.coordinator.stop();
                hot_reload.consumer.abort();
            }
        }

        for name in inner.registry.shutdown() {
            inner.factory.limiter().reset_quota(&name);
            self.emit(RuntimeEvent::PluginUnloaded { name });
        }

        if !inner.sandbox.is_destroyed() {
            inner.sandbox.destroy();
            info!("Plugin runtime shut down");
        }
    }

    /// Allow/block lists, then dependencies.
    fn admit(&self, manifest: &PluginManifest) -> PluginResult<()> {
        let config = &self.inner.config;
        let name = &manifest.name;

        if !config.allow_list.is_empty() && !config.allow_list.iter().any(|n| n == name) {
            return Err(PluginError::Rejected {
                plugin: name.clone(),
                reason: "not in the allow-list".into(),
            });
        }
        if config.block_list.iter().any(|n| n == name) {
            return Err(PluginError::Rejected {
                plugin: name.clone(),
                reason: "block-listed".into(),
            });
        }
        if let Some(missing) = manifest
            .dependencies
            .iter()
            .find(|dep| !self.inner.registry.is_loaded(dep))
        {
            return Err(PluginError::LoadFailed {
                plugin: name.clone(),
                message: format!("dependency '{missing}' is not loaded"),
            });
        }
        Ok(())
    }

    #[cfg(feature = "watch")]
    fn load_appeared(&self, name: &str, plugin_dir: &Path) {
        let discovered = match self.inner.registry.discover_plugins() {
            Ok(found) => found,
            Err(e) => {
                self.report(Some(name), &e);
                return;
            },
        };
        let Some(found) = discovered
            .into_iter()
            .find(|p| p.name() == Some(name))
        else {
            debug!(plugin = %name, dir = %plugin_dir.display(), "Changed plugin not found by discovery");
            return;
        };

        info!(plugin = %name, "New plugin appeared, loading");
        if let Err(e) = self.load_plugin(&found.dir) {
            self.report(Some(name), &e);
        }
    }

    #[cfg(feature = "watch")]
    fn report(&self, plugin: Option<&str>, error: &PluginError) {
        warn!(plugin = ?plugin, error = %error, "Hot-reload action failed");
        self.emit(RuntimeEvent::Error {
            plugin: plugin.map(str::to_owned),
            message: error.to_string(),
        });
    }

    fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("plugin_dir", &self.inner.config.plugin_dir)
            .field("loaded", &self.inner.registry.len())
            .field("sandbox", &self.inner.sandbox)
            .finish_non_exhaustive()
    }
}

/// Order plugins so that each comes after the discovered plugins it depends
/// on. Cycles and dependencies outside the batch keep their discovery order
/// and fail the dependency check at load time.
fn dependency_order(
    mut pending: Vec<(PathBuf, PluginManifest)>,
) -> Vec<(PathBuf, PluginManifest)> {
    let mut ordered: Vec<(PathBuf, PluginManifest)> = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let ready = pending.iter().position(|(_, manifest)| {
            manifest.dependencies.iter().all(|dep| {
                ordered.iter().any(|(_, m)| &m.name == dep)
                    || !pending.iter().any(|(_, m)| &m.name == dep)
            })
        });
        match ready {
            Some(index) => ordered.push(pending.remove(index)),
            None => {
                ordered.append(&mut pending);
            },
        }
    }
    ordered
}
