//! Hot-reload coordinator.
//!
//! Watches the plugin directory and turns filesystem churn into typed
//! [`WatchEvent`]s. It never touches loaded state; the runtime consumes the
//! events and decides what to do.
//!
//! ```text
//! filesystem events (notify)
//!   → filter ignored dirs (node_modules, target, dist, .git)
//!   → map to plugin directory (first component under the root)
//!   → debounce per plugin directory
//!   → manifest gone?  → Unload { last name seen there }
//!   → blake3 hash of the source tree unchanged? → nothing
//!   → otherwise        → Reload { manifest name }
//! ```

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::{discover_manifests, load_manifest};
use crate::error::{PluginError, PluginResult};
use crate::manifest::MANIFEST_FILE_NAME;

/// Default debounce interval for file change events.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Directory names ignored while watching and hashing.
pub const IGNORED_DIRS: &[&str] = &["node_modules", "target", "dist", ".git"];

/// Events emitted by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A plugin's sources changed, or a new plugin appeared.
    Reload {
        /// Manifest name.
        name: String,
        /// Plugin directory.
        plugin_dir: PathBuf,
    },
    /// The manifest backing a plugin was deleted.
    Unload {
        /// The name last seen in that directory.
        name: String,
        /// Plugin directory.
        plugin_dir: PathBuf,
    },
    /// A non-fatal problem (bad manifest, hashing failure, watcher error).
    Error(String),
}

/// Coordinator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Created, not yet watching.
    Idle,
    /// Watching the plugin directory.
    Watching,
    /// Stopped for good.
    Stopped,
}

const IDLE: u8 = 0;
const WATCHING: u8 = 1;
const STOPPED: u8 = 2;

/// Configuration for the coordinator.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Directory whose subdirectories are plugins.
    pub root: PathBuf,
    /// Changes to one plugin within this window collapse into one event.
    pub debounce: Duration,
}

impl WatcherConfig {
    /// Watch `root` with the default debounce.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

/// Watches the plugin directory and emits [`WatchEvent`]s.
#[derive(Debug)]
pub struct HotReloadCoordinator {
    config: WatcherConfig,
    state: AtomicU8,
    shutdown: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HotReloadCoordinator {
    /// Create an idle coordinator.
    #[must_use]
    pub fn new(config: WatcherConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(IDLE),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WatchState {
        match self.state.load(Ordering::SeqCst) {
            IDLE => WatchState::Idle,
            WATCHING => WatchState::Watching,
            _ => WatchState::Stopped,
        }
    }

    /// Start watching. Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::Watcher`] if the coordinator is not idle, the
    /// root does not exist, or the OS watcher cannot be started. The
    /// coordinator stays idle on failure.
    pub fn watch(&self) -> PluginResult<mpsc::Receiver<WatchEvent>> {
        if self.state() != WatchState::Idle {
            return Err(PluginError::Watcher(format!(
                "coordinator is {:?}, not idle",
                self.state()
            )));
        }
        if !self.config.root.is_dir() {
            return Err(PluginError::Watcher(format!(
                "plugin directory {} does not exist",
                self.config.root.display()
            )));
        }
        // Event paths arrive canonicalized on some platforms.
        let root = &self
            .config
            .root
            .canonicalize()
            .unwrap_or_else(|_| self.config.root.clone());

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .map_err(|e| PluginError::Watcher(format!("filesystem watcher: {e}")))?;
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| PluginError::Watcher(format!("watch {}: {e}", root.display())))?;

        if self
            .state
            .compare_exchange(IDLE, WATCHING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(PluginError::Watcher("coordinator already started".into()));
        }

        let (event_tx, event_rx) = mpsc::channel(64);
        let watch_loop = WatchLoop {
            root: root.clone(),
            debounce: self.config.debounce,
            known: seed_known(root),
            _watcher: watcher,
            raw_rx,
            event_tx,
        };
        let handle = tokio::spawn(watch_loop.run(self.shutdown.clone()));
        *self.task.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);

        info!(root = %root.display(), debounce_ms = self.config.debounce.as_millis(), "Watching plugin directory");
        Ok(event_rx)
    }

    /// Stop watching and release the OS watch handle. Idempotent.
    pub fn stop(&self) {
        let previous = self.state.swap(STOPPED, Ordering::SeqCst);
        self.shutdown.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        if previous != STOPPED {
            info!("Hot-reload coordinator stopped");
        }
    }
}

impl Drop for HotReloadCoordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// What the loop last saw in a plugin directory.
#[derive(Debug, Clone)]
struct Known {
    name: String,
    hash: String,
}

struct WatchLoop {
    root: PathBuf,
    debounce: Duration,
    known: HashMap<PathBuf, Known>,
    /// Dropping this stops OS-level monitoring.
    _watcher: RecommendedWatcher,
    raw_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    event_tx: mpsc::Sender<WatchEvent>,
}

impl WatchLoop {
    async fn run(mut self, shutdown: CancellationToken) {
        let mut pending: HashMap<PathBuf, tokio::time::Instant> = HashMap::new();

        loop {
            let next_deadline = pending.values().copied().min();

            tokio::select! {
                biased;

                () = shutdown.cancelled() => {
                    debug!("Watch loop cancelled");
                    return;
                }

                () = async {
                    match next_deadline {
                        Some(deadline) => tokio::time::sleep_until(deadline).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    let now = tokio::time::Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, deadline)| **deadline <= now)
                        .map(|(dir, _)| dir.clone())
                        .collect();
                    for plugin_dir in ready {
                        pending.remove(&plugin_dir);
                        if !self.process(&plugin_dir).await {
                            return;
                        }
                    }
                }

                event = self.raw_rx.recv() => {
                    match event {
                        Some(Ok(ev)) => self.track(&ev, &mut pending),
                        Some(Err(e)) => {
                            warn!(error = %e, "Filesystem watcher error");
                            if !self.emit(WatchEvent::Error(e.to_string())).await {
                                return;
                            }
                        }
                        None => {
                            debug!("Filesystem watcher channel closed, stopping");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Reset the debounce timer for every plugin directory the event touches.
    fn track(&self, event: &Event, pending: &mut HashMap<PathBuf, tokio::time::Instant>) {
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {},
            _ => return,
        }
        for path in &event.paths {
            if is_in_ignored_dir(path) {
                continue;
            }
            if let Some(plugin_dir) = plugin_dir_for(&self.root, path) {
                debug!(path = %path.display(), plugin_dir = %plugin_dir.display(), kind = ?event.kind, "File change detected");
                #[allow(clippy::arithmetic_side_effects)]
                // Instant + Duration cannot overflow in practice
                let deadline = tokio::time::Instant::now() + self.debounce;
                pending.insert(plugin_dir, deadline);
            }
        }
    }

    /// Inspect a settled plugin directory and emit at most one intent
    /// (two on a rename). Returns `false` once the receiver is gone.
    async fn process(&mut self, plugin_dir: &Path) -> bool {
        let dir = plugin_dir.to_path_buf();
        let inspected = tokio::task::spawn_blocking(move || inspect(&dir)).await;
        let inspected = match inspected {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Inspection task failed");
                return true;
            },
        };

        match inspected {
            Inspection::Gone => match self.known.remove(plugin_dir) {
                Some(previous) => {
                    info!(plugin = %previous.name, "Plugin manifest removed, requesting unload");
                    self.emit(WatchEvent::Unload {
                        name: previous.name,
                        plugin_dir: plugin_dir.to_path_buf(),
                    })
                    .await
                },
                None => true,
            },
            Inspection::Invalid(message) => {
                warn!(plugin_dir = %plugin_dir.display(), error = %message, "Changed plugin has an invalid manifest");
                self.emit(WatchEvent::Error(message)).await
            },
            Inspection::Present { name, hash } => {
                let previous = self.known.get(plugin_dir).cloned();
                if previous.as_ref().is_some_and(|k| k.hash == hash && k.name == name) {
                    debug!(plugin = %name, "Source hash unchanged, skipping reload");
                    return true;
                }
                if let Some(previous) = previous.filter(|k| k.name != name) {
                    info!(from = %previous.name, to = %name, "Plugin renamed");
                    if !self
                        .emit(WatchEvent::Unload {
                            name: previous.name,
                            plugin_dir: plugin_dir.to_path_buf(),
                        })
                        .await
                    {
                        return false;
                    }
                }
                info!(plugin = %name, hash = %hash, "Plugin source changed, requesting reload");
                self.known.insert(
                    plugin_dir.to_path_buf(),
                    Known {
                        name: name.clone(),
                        hash,
                    },
                );
                self.emit(WatchEvent::Reload {
                    name,
                    plugin_dir: plugin_dir.to_path_buf(),
                })
                .await
            },
        }
    }

    async fn emit(&self, event: WatchEvent) -> bool {
        if self.event_tx.send(event).await.is_err() {
            debug!("Event receiver dropped, stopping watcher");
            return false;
        }
        true
    }
}

enum Inspection {
    Gone,
    Invalid(String),
    Present { name: String, hash: String },
}

fn inspect(plugin_dir: &Path) -> Inspection {
    let manifest_path = plugin_dir.join(MANIFEST_FILE_NAME);
    if !manifest_path.is_file() {
        return Inspection::Gone;
    }
    let manifest = match load_manifest(&manifest_path) {
        Ok(m) => m,
        Err(e) => return Inspection::Invalid(e.to_string()),
    };
    match compute_source_hash(plugin_dir) {
        Ok(hash) => Inspection::Present {
            name: manifest.name,
            hash,
        },
        Err(e) => Inspection::Invalid(format!(
            "hash failed for {}: {e}",
            plugin_dir.display()
        )),
    }
}

/// Record the name and hash of every valid plugin already on disk, so the
/// first change is compared against real content and deletions can be named.
fn seed_known(root: &Path) -> HashMap<PathBuf, Known> {
    let mut known = HashMap::new();
    let Ok(found) = discover_manifests(root) else {
        return known;
    };
    for plugin in found {
        let Ok(manifest) = plugin.manifest else { continue };
        if let Ok(hash) = compute_source_hash(&plugin.dir) {
            known.insert(
                plugin.dir,
                Known {
                    name: manifest.name,
                    hash,
                },
            );
        }
    }
    known
}

/// The plugin directory owning `path`: the first component below `root`.
fn plugin_dir_for(root: &Path, path: &Path) -> Option<PathBuf> {
    let rel = path.strip_prefix(root).ok()?;
    match rel.components().next()? {
        Component::Normal(first) => Some(root.join(first)),
        _ => None,
    }
}

fn is_in_ignored_dir(path: &Path) -> bool {
    path.components().any(|c| {
        c.as_os_str()
            .to_str()
            .is_some_and(|s| IGNORED_DIRS.contains(&s))
    })
}

/// Deterministic blake3 hash over a plugin's source tree.
///
/// Files are sorted by relative path; each contributes its length-prefixed
/// path and content. Ignored directories and symlinks are skipped.
///
/// # Errors
///
/// Returns an error if the directory itself cannot be read.
pub fn compute_source_hash(dir: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut paths = Vec::new();
    collect_source_paths(dir, &mut paths)?;
    paths.sort();

    for path in &paths {
        let Ok(rel) = path.strip_prefix(dir) else {
            continue;
        };
        match std::fs::read(path) {
            Ok(content) => {
                let rel = rel.to_string_lossy();
                let rel = rel.as_bytes();
                hasher.update(&(rel.len() as u64).to_le_bytes());
                hasher.update(rel);
                hasher.update(&(content.len() as u64).to_le_bytes());
                hasher.update(&content);
            },
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Skipping unreadable file in hash");
            },
        }
    }

    Ok(hasher.finalize().to_hex().to_string())
}

fn collect_source_paths(dir: &Path, paths: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            continue;
        }
        let path = entry.path();
        if file_type.is_dir() {
            let name = entry.file_name();
            if IGNORED_DIRS.iter().any(|&d| d == name.to_string_lossy()) {
                continue;
            }
            collect_source_paths(&path, paths)?;
        } else if file_type.is_file() {
            paths.push(path);
        }
    }
    Ok(())
}
