//! Permission-scoped capability objects.
//!
//! Every gated method runs the same two checks before touching a backend:
//! the plugin must hold the method's permission, then the plugin's shared
//! rate-limiter window must have room. Either failure returns immediately
//! and the backend is never called.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{BackendError, Backends};
use crate::context::PluginContext;
use crate::error::{PluginError, PluginResult};
use crate::manifest::{Permission, PluginManifest};
use crate::rate_limit::RateLimiter;

mod drive;
mod network;
mod sheets;
mod storage;

pub use drive::DriveCapability;
pub use network::NetworkCapability;
pub use sheets::SheetsCapability;
pub use storage::{KvStore, StorageCapability};

/// The permission a context method requires, or `None` if it is ungated.
#[must_use]
pub fn required_permission(method: &str) -> Option<Permission> {
    match method {
        "sheets.get" | "sheets.batchGet" => Some(Permission::SheetsRead),
        "sheets.update" | "sheets.batchUpdate" => Some(Permission::SheetsWrite),
        "sheets.create" => Some(Permission::SheetsCreate),
        "drive.get" | "drive.list" => Some(Permission::DriveRead),
        "drive.create" | "drive.update" | "drive.delete" => Some(Permission::DriveWrite),
        "network.fetch" => Some(Permission::NetworkFetch),
        _ => None,
    }
}

/// Permission and quota check shared by one plugin's capabilities.
#[derive(Debug, Clone)]
pub(crate) struct Gate {
    plugin: String,
    granted: Arc<HashSet<Permission>>,
    limiter: Arc<RateLimiter>,
}

impl Gate {
    pub(crate) fn new(
        plugin: impl Into<String>,
        granted: impl IntoIterator<Item = Permission>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            granted: Arc::new(granted.into_iter().collect()),
            limiter,
        }
    }

    /// Fail fast on a missing grant, then on an exhausted quota.
    pub(crate) fn check(&self, permission: Permission) -> PluginResult<()> {
        if !self.granted.contains(&permission) {
            debug!(plugin = %self.plugin, permission = %permission, "capability call denied");
            return Err(PluginError::PermissionDenied {
                plugin: self.plugin.clone(),
                permission: permission.to_string(),
            });
        }
        if !self.limiter.check_quota(&self.plugin) {
            let remaining = self.limiter.remaining_quota(&self.plugin);
            debug!(plugin = %self.plugin, remaining, "capability call throttled");
            return Err(PluginError::QuotaExceeded {
                plugin: self.plugin.clone(),
                remaining,
            });
        }
        Ok(())
    }

    pub(crate) fn backend_error(&self, error: BackendError) -> PluginError {
        PluginError::Backend {
            plugin: self.plugin.clone(),
            message: error.0,
        }
    }

    pub(crate) fn not_configured(&self, backend: &str) -> PluginError {
        PluginError::Backend {
            plugin: self.plugin.clone(),
            message: format!("{backend} backend not configured"),
        }
    }
}

/// Builds a fresh [`PluginContext`] for a manifest.
///
/// Capability fields are derived from the manifest every time, so a reload
/// that changes the declared permissions changes what the plugin can reach.
#[derive(Debug, Clone)]
pub struct CapabilityFactory {
    limiter: Arc<RateLimiter>,
    backends: Backends,
    storage: Arc<KvStore>,
}

impl CapabilityFactory {
    /// Create a factory over a shared limiter, backends and storage.
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>, backends: Backends, storage: Arc<KvStore>) -> Self {
        Self {
            limiter,
            backends,
            storage,
        }
    }

    /// The shared rate limiter.
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Build a context whose capabilities match the manifest's permissions.
    #[must_use]
    pub fn build(&self, manifest: &PluginManifest) -> PluginContext {
        let gate = Gate::new(
            manifest.name.clone(),
            manifest.permissions.iter().copied(),
            Arc::clone(&self.limiter),
        );

        let mut context = PluginContext::new(manifest);
        context.storage = Some(StorageCapability::new(
            manifest.name.clone(),
            Arc::clone(&self.storage),
        ));
        if manifest.grants_any("sheets") {
            context.sheets = Some(SheetsCapability::new(
                gate.clone(),
                self.backends.sheets.clone(),
            ));
        }
        if manifest.grants_any("drive") {
            context.drive = Some(DriveCapability::new(
                gate.clone(),
                self.backends.drive.clone(),
            ));
        }
        if manifest.grants_any("network") {
            context.network = Some(NetworkCapability::new(gate, self.backends.network.clone()));
        }

        debug!(
            plugin = %manifest.name,
            sheets = context.sheets.is_some(),
            drive = context.drive.is_some(),
            network = context.network.is_some(),
            "built plugin context"
        );
        context
    }
}
