//! Outbound network capability.

use std::fmt;
use std::sync::Arc;

use super::Gate;
use crate::backend::{FetchRequest, FetchResponse, NetworkBackend};
use crate::error::PluginResult;
use crate::manifest::Permission;

/// Gated outbound requests for one plugin.
#[derive(Clone)]
pub struct NetworkCapability {
    gate: Gate,
    backend: Option<Arc<dyn NetworkBackend>>,
}

impl NetworkCapability {
    pub(crate) fn new(gate: Gate, backend: Option<Arc<dyn NetworkBackend>>) -> Self {
        Self { gate, backend }
    }

    /// Perform a request. Requires `network.fetch`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn fetch(&self, request: FetchRequest) -> PluginResult<FetchResponse> {
        self.gate.check(Permission::NetworkFetch)?;
        let backend = self
            .backend
            .as_ref()
            .ok_or_else(|| self.gate.not_configured("network"))?;
        backend
            .fetch(request)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }
}

impl fmt::Debug for NetworkCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCapability")
            .field("gate", &self.gate)
            .field("backend", &self.backend.is_some())
            .finish()
    }
}
