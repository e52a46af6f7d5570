//! Sheets capability.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::Gate;
use crate::backend::SheetsBackend;
use crate::error::PluginResult;
use crate::manifest::Permission;

/// Gated access to the sheets backend for one plugin.
#[derive(Clone)]
pub struct SheetsCapability {
    gate: Gate,
    backend: Option<Arc<dyn SheetsBackend>>,
}

impl SheetsCapability {
    pub(crate) fn new(gate: Gate, backend: Option<Arc<dyn SheetsBackend>>) -> Self {
        Self { gate, backend }
    }

    fn backend(&self) -> PluginResult<&Arc<dyn SheetsBackend>> {
        self.backend
            .as_ref()
            .ok_or_else(|| self.gate.not_configured("sheets"))
    }

    /// Read a document or one range. Requires `sheets.read`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn get(&self, doc_id: &str, range: Option<&str>) -> PluginResult<Value> {
        self.gate.check(Permission::SheetsRead)?;
        self.backend()?
            .get(doc_id, range)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }

    /// Write values into a range. Requires `sheets.write`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn update(&self, doc_id: &str, range: &str, values: Value) -> PluginResult<Value> {
        self.gate.check(Permission::SheetsWrite)?;
        self.backend()?
            .update(doc_id, range, values)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }

    /// Create a document. Requires `sheets.create`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn create(&self, properties: Value) -> PluginResult<String> {
        self.gate.check(Permission::SheetsCreate)?;
        self.backend()?
            .create(properties)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }

    /// Read several ranges. Requires `sheets.read`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn batch_get(&self, doc_id: &str, ranges: &[String]) -> PluginResult<Vec<Value>> {
        self.gate.check(Permission::SheetsRead)?;
        self.backend()?
            .batch_get(doc_id, ranges)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }

    /// Apply several update requests. Requires `sheets.write`.
    ///
    /// # Errors
    ///
    /// Permission, quota, or backend failure.
    pub async fn batch_update(&self, doc_id: &str, requests: Vec<Value>) -> PluginResult<Vec<Value>> {
        self.gate.check(Permission::SheetsWrite)?;
        self.backend()?
            .batch_update(doc_id, requests)
            .await
            .map_err(|e| self.gate.backend_error(e))
    }
}

impl fmt::Debug for SheetsCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SheetsCapability")
            .field("gate", &self.gate)
            .field("backend", &self.backend.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::backend::BackendResult;
    use crate::error::{ErrorKind, PluginError};
    use crate::rate_limit::RateLimiter;

    #[derive(Default)]
    struct CountingSheets {
        calls: AtomicUsize,
    }

    impl CountingSheets {
        fn bump(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SheetsBackend for CountingSheets {
        async fn get(&self, _: &str, _: Option<&str>) -> BackendResult<Value> {
            self.bump();
            Ok(json!("cell"))
        }
        async fn update(&self, _: &str, _: &str, _: Value) -> BackendResult<Value> {
            self.bump();
            Ok(json!({}))
        }
        async fn create(&self, _: Value) -> BackendResult<String> {
            self.bump();
            Ok("new".into())
        }
        async fn batch_get(&self, _: &str, ranges: &[String]) -> BackendResult<Vec<Value>> {
            self.bump();
            Ok(ranges.iter().map(|_| Value::Null).collect())
        }
        async fn batch_update(&self, _: &str, requests: Vec<Value>) -> BackendResult<Vec<Value>> {
            self.bump();
            Ok(requests)
        }
    }

    fn capability(
        granted: &[Permission],
        rpm: u32,
    ) -> (SheetsCapability, Arc<CountingSheets>) {
        let backend = Arc::new(CountingSheets::default());
        let gate = Gate::new("p", granted.iter().copied(), Arc::new(RateLimiter::new(rpm)));
        let backend_dyn: Arc<dyn SheetsBackend> = backend.clone();
        (SheetsCapability::new(gate, Some(backend_dyn)), backend)
    }

    #[tokio::test]
    async fn test_read_only_grant_blocks_writes() {
        let (sheets, backend) = capability(&[Permission::SheetsRead], 100);

        assert_eq!(sheets.get("doc", None).await.unwrap(), json!("cell"));
        let err = sheets.update("doc", "A1", json!([1])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert!(err.to_string().contains("sheets.write"));
        assert!(sheets.create(json!({})).await.is_err());
        assert!(sheets.batch_update("doc", vec![]).await.is_err());

        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_quota_stops_backend_calls() {
        let (sheets, backend) = capability(&[Permission::SheetsRead], 2);
        assert!(sheets.get("doc", None).await.is_ok());
        assert!(sheets.batch_get("doc", &["A1".into()]).await.is_ok());
        let err = sheets.get("doc", None).await.unwrap_err();
        assert!(matches!(err, PluginError::QuotaExceeded { remaining: 0, .. }));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_backend_is_runtime_error() {
        let gate = Gate::new("p", [Permission::SheetsRead], Arc::new(RateLimiter::new(5)));
        let sheets = SheetsCapability::new(gate, None);
        let err = sheets.get("doc", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RuntimeError);
        assert!(err.to_string().contains("backend not configured"));
    }
}
