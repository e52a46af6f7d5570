//! Backend operation traits.
//!
//! Capabilities delegate to these after their permission and quota checks
//! pass. The runtime never interprets backend failures beyond "it failed".

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[cfg(feature = "http")]
mod http;
mod memory;

#[cfg(feature = "http")]
pub use http::HttpNetworkBackend;
pub use memory::{MemoryDrive, MemorySheets};

/// A failure reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    /// Create an error from any message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Result type for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// A spreadsheet-like document backend.
#[async_trait]
pub trait SheetsBackend: Send + Sync {
    /// Read a whole document, or one range of it.
    async fn get(&self, doc_id: &str, range: Option<&str>) -> BackendResult<Value>;

    /// Write `values` into `range`, returning an update summary.
    async fn update(&self, doc_id: &str, range: &str, values: Value) -> BackendResult<Value>;

    /// Create a document, returning its id.
    async fn create(&self, properties: Value) -> BackendResult<String>;

    /// Read several ranges at once.
    async fn batch_get(&self, doc_id: &str, ranges: &[String]) -> BackendResult<Vec<Value>>;

    /// Apply several update requests, returning one reply per request.
    async fn batch_update(&self, doc_id: &str, requests: Vec<Value>) -> BackendResult<Vec<Value>>;
}

/// A file-store-like backend.
#[async_trait]
pub trait DriveBackend: Send + Sync {
    /// Fetch one file's metadata and content.
    async fn get(&self, file_id: &str) -> BackendResult<Value>;

    /// List files, optionally filtered by a name substring.
    async fn list(&self, query: Option<&str>) -> BackendResult<Vec<Value>>;

    /// Create a file, returning its id.
    async fn create(&self, file: Value) -> BackendResult<String>;

    /// Merge `patch` into a file, returning the updated file.
    async fn update(&self, file_id: &str, patch: Value) -> BackendResult<Value>;

    /// Delete a file.
    async fn delete(&self, file_id: &str) -> BackendResult<()>;
}

/// An outbound HTTP request issued by plugin code.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Absolute URL.
    pub url: String,
    /// HTTP method, `GET` when absent.
    #[serde(default = "default_method")]
    pub method: String,
    /// Request headers.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Request body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_owned()
}

/// Response to a [`FetchRequest`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: BTreeMap<String, String>,
    /// Response body as text.
    pub body: String,
}

/// An outbound network backend.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Perform the request.
    async fn fetch(&self, request: FetchRequest) -> BackendResult<FetchResponse>;
}

/// The backends available to capabilities. Any may be absent.
#[derive(Clone, Default)]
pub struct Backends {
    /// Sheets-like backend.
    pub sheets: Option<Arc<dyn SheetsBackend>>,
    /// Drive-like backend.
    pub drive: Option<Arc<dyn DriveBackend>>,
    /// Outbound network backend.
    pub network: Option<Arc<dyn NetworkBackend>>,
}

impl Backends {
    /// No backends configured.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Fresh in-memory sheets and drive backends, no network.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            sheets: Some(Arc::new(MemorySheets::new())),
            drive: Some(Arc::new(MemoryDrive::new())),
            network: None,
        }
    }

    /// Set the sheets backend.
    #[must_use]
    pub fn with_sheets(mut self, backend: Arc<dyn SheetsBackend>) -> Self {
        self.sheets = Some(backend);
        self
    }

    /// Set the drive backend.
    #[must_use]
    pub fn with_drive(mut self, backend: Arc<dyn DriveBackend>) -> Self {
        self.drive = Some(backend);
        self
    }

    /// Set the network backend.
    #[must_use]
    pub fn with_network(mut self, backend: Arc<dyn NetworkBackend>) -> Self {
        self.network = Some(backend);
        self
    }
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backends")
            .field("sheets", &self.sheets.is_some())
            .field("drive", &self.drive.is_some())
            .field("network", &self.network.is_some())
            .finish()
    }
}
