//! Drive capability.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::Gate;
use crate::backend::DriveBackend;
use crate::error::PluginResult;
use crate::manifest::Permission;

/// Gated access to the drive backend for one plugin.
#[derive(Clone)]
pub struct DriveCapability {
    gate: Gate,
    backend: Option<Arc<dyn DriveBackend>>,
}

impl DriveCapability {
    pub(crate) fn new(gate: Gate, backend: Option<Arc<dyn DriveBackend>>) -> Self {
        Self { gate, backend }
    }

    fn backend(&self) -> PluginResult<&Arc<dyn DriveBackend>> {
        self.backend
            .as_ref()
            .ok_or_else(|| self.gate.not_configured("drive"))
    }

    /// Fetch a file. Requires `drive.read`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn get(&self, file_id: &str) -> PluginResult<Value> {
        self.gate.check(Permission::DriveRead)?;
        self.backend()?
            .get(file_id)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }

    /// List files. Requires `drive.read`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn list(&self, query: Option<&str>) -> PluginResult<Vec<Value>> {
        self.gate.check(Permission::DriveRead)?;
        self.backend()?
            .list(query)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }

    /// Create a file. Requires `drive.write`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn create(&self, file: Value) -> PluginResult<String> {
        self.gate.check(Permission::DriveWrite)?;
        self.backend()?
            .create(file)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }

    /// Update a file. Requires `drive.write`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn update(&self, file_id: &str, patch: Value) -> PluginResult<Value> {
        self.gate.check(Permission::DriveWrite)?;
        self.backend()?
            .update(file_id, patch)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }

    /// Delete a file. Requires `drive.write`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn delete(&self, file_id: &str) -> PluginResult<()> {
        self.gate.check(Permission::DriveWrite)?;
        self.backend()?
            .delete(file_id)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }
}

impl fmt::Debug for DriveCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriveCapability")
            .field("gate", &self.gate)
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::backend::MemoryDrive;
    use crate::error::ErrorKind;
    use crate::rate_limit::RateLimiter;

    fn capability(granted: &[Permission]) -> DriveCapability {
        let gate = Gate::new("p", granted.iter().copied(), Arc::new(RateLimiter::new(100)));
        DriveCapability::new(gate, Some(Arc::new(MemoryDrive::new())))
    }

    #[tokio::test]
    async fn test_read_write_round() {
        let drive = capability(&[Permission::DriveRead, Permission::DriveWrite]);
        let id = drive.create(json!({ "name": "notes.md" })).await.unwrap();
        assert_eq!(drive.get(&id).await.unwrap()["name"], "notes.md");
        assert_eq!(drive.list(None).await.unwrap().len(), 1);
        drive.delete(&id).await.unwrap();
        assert!(drive.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_only_cannot_write() {
        let drive = capability(&[Permission::DriveRead]);
        assert!(drive.list(None).await.is_ok());
        for err in [
            drive.create(json!({})).await.unwrap_err(),
            drive.update("x", json!({})).await.unwrap_err(),
            drive.delete("x").await.unwrap_err(),
        ] {
            assert_eq!(err.kind(), ErrorKind::PermissionDenied);
            assert!(err.to_string().contains("drive.write"));
        }
    }

    #[tokio::test]
    async fn test_backend_error_is_runtime_error() {
        let drive = capability(&[Permission::DriveRead]);
        let err = drive.get("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
        assert!(err.to_string().contains("file not found"));
    }
}
