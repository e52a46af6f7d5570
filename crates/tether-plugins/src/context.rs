//! The context object handed to every handler invocation.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::backend::FetchRequest;
use crate::capabilities::{
    DriveCapability, NetworkCapability, SheetsCapability, StorageCapability, required_permission,
};
use crate::error::{PluginError, PluginResult};
use crate::manifest::PluginManifest;
use crate::sandbox::HostContext;

/// Tracing target for messages plugins log through `context.logger`.
pub const PLUGIN_LOG_TARGET: &str = "tether::plugin";

/// Severity of a plugin log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warn.
    Warn,
    /// Error.
    Error,
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Structured logger bound to one plugin name.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin: String,
}

impl PluginLogger {
    /// Create a logger for `plugin`.
    #[must_use]
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
        }
    }

    /// Emit `message` with optional JSON metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Option<&Value>) {
        let metadata = metadata.map(Value::to_string).unwrap_or_default();
        let plugin = self.plugin.as_str();
        match level {
            LogLevel::Debug => debug!(target: PLUGIN_LOG_TARGET, plugin, metadata = %metadata, "{message}"),
            LogLevel::Info => info!(target: PLUGIN_LOG_TARGET, plugin, metadata = %metadata, "{message}"),
            LogLevel::Warn => warn!(target: PLUGIN_LOG_TARGET, plugin, metadata = %metadata, "{message}"),
            LogLevel::Error => error!(target: PLUGIN_LOG_TARGET, plugin, metadata = %metadata, "{message}"),
        }
    }
}

/// Per-plugin context: identity, config, logger, and the capabilities the
/// manifest's permissions entitle it to.
///
/// A capability field is `Some` if and only if the manifest declared a
/// permission in that backend's namespace. Storage is always present once
/// the runtime has attached capabilities.
pub struct PluginContext {
    plugin: String,
    version: String,
    config: HashMap<String, Value>,
    logger: PluginLogger,
    pub(crate) sheets: Option<SheetsCapability>,
    pub(crate) drive: Option<DriveCapability>,
    pub(crate) network: Option<NetworkCapability>,
    pub(crate) storage: Option<StorageCapability>,
}

impl PluginContext {
    /// A bare context with no capabilities attached.
    #[must_use]
    pub fn new(manifest: &PluginManifest) -> Self {
        Self {
            plugin: manifest.name.clone(),
            version: manifest.version.clone(),
            config: manifest.config.clone(),
            logger: PluginLogger::new(manifest.name.clone()),
            sheets: None,
            drive: None,
            network: None,
            storage: None,
        }
    }

    /// Plugin name.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Plugin version.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The manifest's `[config]` table.
    #[must_use]
    pub fn config(&self) -> &HashMap<String, Value> {
        &self.config
    }

    /// The plugin's logger.
    #[must_use]
    pub fn logger(&self) -> &PluginLogger {
        &self.logger
    }

    /// Sheets capability, if any `sheets.*` permission was declared.
    #[must_use]
    pub fn sheets(&self) -> Option<&SheetsCapability> {
        self.sheets.as_ref()
    }

    /// Drive capability, if any `drive.*` permission was declared.
    #[must_use]
    pub fn drive(&self) -> Option<&DriveCapability> {
        self.drive.as_ref()
    }

    /// Network capability, if `network.fetch` was declared.
    #[must_use]
    pub fn network(&self) -> Option<&NetworkCapability> {
        self.network.as_ref()
    }

    /// Storage capability.
    #[must_use]
    pub fn storage(&self) -> Option<&StorageCapability> {
        self.storage.as_ref()
    }

    fn denied(&self, method: &str) -> PluginError {
        match required_permission(method) {
            Some(permission) => PluginError::PermissionDenied {
                plugin: self.plugin.clone(),
                permission: permission.to_string(),
            },
            None => self.bad_call(method, "capability not available"),
        }
    }

    fn bad_call(&self, method: &str, message: &str) -> PluginError {
        PluginError::Runtime {
            plugin: self.plugin.clone(),
            message: format!("{method}: {message}"),
        }
    }

    async fn dispatch(&self, method: &str, args: &mut CallArgs<'_>) -> PluginResult<Value> {
        let (namespace, op) = method.split_once('.').unwrap_or((method, ""));
        match namespace {
            "logger" => {
                let level = LogLevel::parse(op)
                    .ok_or_else(|| self.bad_call(method, "unknown log level"))?;
                let message = match args.take(0) {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let metadata = args.take(1);
                self.logger
                    .log(level, &message, (!metadata.is_null()).then_some(&metadata));
                Ok(Value::Null)
            },
            "storage" => {
                let storage = self.storage.as_ref().ok_or_else(|| self.denied(method))?;
                match op {
                    "get" => Ok(storage.get(&args.string(0, "key")?).unwrap_or(Value::Null)),
                    "set" => {
                        let key = args.string(0, "key")?;
                        storage.set(&key, args.take(1));
                        Ok(Value::Null)
                    },
                    "delete" => Ok(Value::Bool(storage.delete(&args.string(0, "key")?))),
                    "list" => Ok(json!(storage.list())),
                    "clear" => {
                        storage.clear();
                        Ok(Value::Null)
                    },
                    _ => Err(self.bad_call(method, "unknown method")),
                }
            },
            "sheets" => {
                let sheets = self.sheets.as_ref().ok_or_else(|| self.denied(method))?;
                match op {
                    "get" => {
                        let doc = args.string(0, "docId")?;
                        let range = args.opt_string(1, "range")?;
                        sheets.get(&doc, range.as_deref()).await
                    },
                    "update" => {
                        let doc = args.string(0, "docId")?;
                        let range = args.string(1, "range")?;
                        sheets.update(&doc, &range, args.take(2)).await
                    },
                    "create" => sheets.create(args.take(0)).await.map(Value::String),
                    "batchGet" => {
                        let doc = args.string(0, "docId")?;
                        let ranges = args.strings(1, "ranges")?;
                        sheets.batch_get(&doc, &ranges).await.map(Value::Array)
                    },
                    "batchUpdate" => {
                        let doc = args.string(0, "docId")?;
                        let requests = args.array(1, "requests")?;
                        sheets.batch_update(&doc, requests).await.map(Value::Array)
                    },
                    _ => Err(self.bad_call(method, "unknown method")),
                }
            },
            "drive" => {
                let drive = self.drive.as_ref().ok_or_else(|| self.denied(method))?;
                match op {
                    "get" => drive.get(&args.string(0, "fileId")?).await,
                    "list" => {
                        let query = args.opt_string(0, "query")?;
                        drive.list(query.as_deref()).await.map(Value::Array)
                    },
                    "create" => drive.create(args.take(0)).await.map(Value::String),
                    "update" => {
                        let id = args.string(0, "fileId")?;
                        drive.update(&id, args.take(1)).await
                    },
                    "delete" => drive
                        .delete(&args.string(0, "fileId")?)
                        .await
                        .map(|()| Value::Null),
                    _ => Err(self.bad_call(method, "unknown method")),
                }
            },
            "network" if op == "fetch" => {
                let network = self.network.as_ref().ok_or_else(|| self.denied(method))?;
                let url = args.string(0, "url")?;
                let options: FetchOptions = match args.take(1) {
                    Value::Null => FetchOptions::default(),
                    raw => serde_json::from_value(raw)
                        .map_err(|e| self.bad_call(method, &format!("invalid options: {e}")))?,
                };
                let request = FetchRequest {
                    url,
                    method: options.method.unwrap_or_else(|| "GET".to_owned()),
                    headers: options.headers,
                    body: options.body.map(|b| match b {
                        Value::String(s) => s,
                        other => other.to_string(),
                    }),
                };
                let response = network.fetch(request).await?;
                serde_json::to_value(response)
                    .map_err(|e| self.bad_call(method, &e.to_string()))
            },
            _ => Err(self.bad_call(method, "unknown method")),
        }
    }
}

/// The optional second argument of `context.network.fetch`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FetchOptions {
    method: Option<String>,
    headers: std::collections::BTreeMap<String, String>,
    body: Option<Value>,
}

/// Positional arguments of one bridged call.
struct CallArgs<'a> {
    method: &'a str,
    plugin: &'a str,
    args: Vec<Value>,
}

impl CallArgs<'_> {
    fn take(&mut self, index: usize) -> Value {
        self.args
            .get_mut(index)
            .map(Value::take)
            .unwrap_or(Value::Null)
    }

    fn invalid(&self, index: usize, name: &str, expected: &str) -> PluginError {
        PluginError::Runtime {
            plugin: self.plugin.to_owned(),
            message: format!(
                "{}: argument {} ({name}) must be {expected}",
                self.method,
                index.saturating_add(1)
            ),
        }
    }

    fn string(&mut self, index: usize, name: &str) -> PluginResult<String> {
        match self.take(index) {
            Value::String(s) => Ok(s),
            _ => Err(self.invalid(index, name, "a string")),
        }
    }

    fn opt_string(&mut self, index: usize, name: &str) -> PluginResult<Option<String>> {
        match self.take(index) {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            _ => Err(self.invalid(index, name, "a string")),
        }
    }

    fn array(&mut self, index: usize, name: &str) -> PluginResult<Vec<Value>> {
        match self.take(index) {
            Value::Array(items) => Ok(items),
            _ => Err(self.invalid(index, name, "an array")),
        }
    }

    fn strings(&mut self, index: usize, name: &str) -> PluginResult<Vec<String>> {
        self.array(index, name)?
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(self.invalid(index, name, "an array of strings")),
            })
            .collect()
    }
}

#[async_trait]
impl HostContext for PluginContext {
    fn plugin(&self) -> &str {
        &self.plugin
    }

    fn describe(&self) -> Value {
        json!({
            "plugin": self.plugin,
            "version": self.version,
            "config": self.config,
            "capabilities": {
                "sheets": self.sheets.is_some(),
                "drive": self.drive.is_some(),
                "network": self.network.is_some(),
                "storage": self.storage.is_some(),
            },
        })
    }

    async fn invoke(&self, method: &str, args: Vec<Value>) -> PluginResult<Value> {
        let mut call = CallArgs {
            method,
            plugin: &self.plugin,
            args,
        };
        self.dispatch(method, &mut call).await
    }
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin", &self.plugin)
            .field("version", &self.version)
            .field("sheets", &self.sheets.is_some())
            .field("drive", &self.drive.is_some())
            .field("network", &self.network.is_some())
            .field("storage", &self.storage.is_some())
            .finish_non_exhaustive()
    }
}
