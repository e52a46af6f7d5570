//! Sandboxed, capability-scoped plugin runtime for Tether.
//!
//! Third-party plugins declare tools, resources and prompts in a
//! `plugin.toml` manifest. The host keeps control over everything a plugin
//! can reach:
//!
//! - [`PluginRuntime`]: the façade. Loads plugins (allow/block lists,
//!   dependency check), runs handlers, tracks [`PluginStats`], drives hot
//!   reload, and shuts everything down in order.
//! - [`PluginRegistry`]: the loaded set, with atomic reload.
//! - [`Sandbox`]: runs one handler in a fresh embedded QuickJS interpreter
//!   under memory and wall-clock ceilings.
//! - [`CapabilityFactory`]: builds the [`PluginContext`] whose `sheets`,
//!   `drive` and `network` objects check permission, then quota, before any
//!   backend call.
//! - [`RateLimiter`]: sliding 60-second window per plugin.
//! - [`HotReloadCoordinator`] (feature `watch`): turns file changes into
//!   reload/unload intents.
//!
//! # Errors
//!
//! Every failure maps onto one [`ErrorKind`] with a stable `PLUGIN_*` code.
//! A capability error raised inside plugin code keeps its kind when it
//! crosses back out of the sandbox.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//!
//! use tether_plugins::{Backends, PluginRuntime, RuntimeConfig};
//!
//! # async fn run() -> tether_plugins::PluginResult<()> {
//! let runtime = PluginRuntime::new(RuntimeConfig::default(), Backends::in_memory());
//! runtime.load_plugin(Path::new("plugins/sheet-tools"))?;
//!
//! let out = runtime
//!     .execute_tool_handler("sheet-tools", "read_range", serde_json::json!({ "range": "A1:B2" }))
//!     .await?;
//! println!("{out}");
//! runtime.shutdown();
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod backend;
pub mod capabilities;
pub mod context;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod manifest;
pub mod plugin;
pub mod rate_limit;
pub mod registry;
pub mod runtime;
pub mod sandbox;
pub mod stats;
#[cfg(feature = "watch")]
pub mod watcher;

#[cfg(feature = "http")]
pub use backend::HttpNetworkBackend;
pub use backend::{
    BackendError, BackendResult, Backends, DriveBackend, FetchRequest, FetchResponse,
    MemoryDrive, MemorySheets, NetworkBackend, SheetsBackend,
};
pub use capabilities::{CapabilityFactory, KvStore, required_permission};
pub use context::{LogLevel, PLUGIN_LOG_TARGET, PluginContext, PluginLogger};
pub use discovery::{DiscoveredPlugin, discover_manifests, load_manifest};
pub use error::{ErrorKind, ErrorPayload, PluginError, PluginResult};
pub use handler::{Handler, HandlerSource};
pub use manifest::{HandlerDecl, MANIFEST_FILE_NAME, Permission, PluginManifest};
pub use plugin::{HandlerDef, HandlerKind, LoadedPlugin, PluginSummary};
pub use rate_limit::{QUOTA_WINDOW, RateLimiter};
pub use registry::PluginRegistry;
pub use runtime::{LoadOutcome, PluginRuntime, RuntimeConfig, RuntimeEvent};
pub use sandbox::{Bindings, HostContext, Sandbox, SandboxConfig};
pub use stats::{PluginStats, StatsTracker};
#[cfg(feature = "watch")]
pub use watcher::{HotReloadCoordinator, WatchEvent, WatchState, WatcherConfig};
