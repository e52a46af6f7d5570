//! Shared fixtures for plugin runtime integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;
use tether_plugins::{
    BackendError, BackendResult, Backends, PluginRuntime, RuntimeConfig, SandboxConfig,
    SheetsBackend,
};

/// Sheets backend that counts every call that reaches it.
#[derive(Debug, Default)]
pub struct CountingSheets {
    calls: AtomicUsize,
}

#[allow(dead_code)]
impl CountingSheets {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SheetsBackend for CountingSheets {
    async fn get(&self, doc_id: &str, range: Option<&str>) -> BackendResult<Value> {
        self.hit();
        Ok(json!({ "doc": doc_id, "range": range, "values": [[1, 2], [3, 4]] }))
    }

    async fn update(&self, doc_id: &str, range: &str, _values: Value) -> BackendResult<Value> {
        self.hit();
        Ok(json!({ "doc": doc_id, "updatedRange": range }))
    }

    async fn create(&self, _properties: Value) -> BackendResult<String> {
        self.hit();
        Ok("doc-new".to_owned())
    }

    async fn batch_get(&self, _doc_id: &str, ranges: &[String]) -> BackendResult<Vec<Value>> {
        self.hit();
        Ok(ranges.iter().map(|r| json!({ "range": r })).collect())
    }

    async fn batch_update(&self, doc_id: &str, _requests: Vec<Value>) -> BackendResult<Vec<Value>> {
        self.hit();
        Err(BackendError::new(format!("document {doc_id} is read-only")))
    }
}

/// A plugin directory tree plus the runtime over it.
#[allow(dead_code)]
pub struct Harness {
    pub runtime: PluginRuntime,
    pub sheets: Arc<CountingSheets>,
    pub root: TempDir,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut RuntimeConfig)) -> Self {
        let root = TempDir::new().expect("failed to create tempdir");
        let sheets = CountingSheets::new();
        let mut config = RuntimeConfig {
            plugin_dir: root.path().to_path_buf(),
            sandbox: SandboxConfig {
                memory_limit_mb: 32,
                timeout: Duration::from_millis(2000),
                max_stack_kb: 512,
            },
            hot_reload: false,
            debounce: Duration::from_millis(50),
            ..RuntimeConfig::default()
        };
        tweak(&mut config);
        let backends = Backends::in_memory().with_sheets(sheets.clone());
        Self {
            runtime: PluginRuntime::new(config, backends),
            sheets,
            root,
        }
    }

    pub fn dir(&self) -> &Path {
        self.root.path()
    }

    /// Write `plugins/<name>/plugin.toml` and return the plugin directory.
    pub fn write_plugin(&self, name: &str, manifest: &str) -> PathBuf {
        write_plugin(self.root.path(), name, manifest)
    }
}

/// Write a manifest under `root/<dir>/plugin.toml`.
#[allow(dead_code)]
pub fn write_plugin(root: &Path, dir: &str, manifest: &str) -> PathBuf {
    let path = root.join(dir);
    std::fs::create_dir_all(&path).expect("failed to create plugin dir");
    std::fs::write(path.join("plugin.toml"), manifest).expect("failed to write manifest");
    path
}

/// A manifest with a single tool.
#[allow(dead_code)]
pub fn one_tool(name: &str, permissions: &[&str], tool: &str, handler: &str) -> String {
    let permissions = permissions
        .iter()
        .map(|p| format!("\"{p}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "name = \"{name}\"\nversion = \"1.0.0\"\npermissions = [{permissions}]\n\n[[tools]]\nname = \"{tool}\"\nhandler = '''{handler}'''\n"
    )
}
