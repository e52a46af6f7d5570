//! Loaded plugin state.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::PluginContext;
use crate::error::{PluginError, PluginResult};
use crate::handler::Handler;
use crate::manifest::{HandlerDecl, MANIFEST_FILE_NAME, Permission, PluginManifest};

/// Largest handler source file accepted.
const MAX_HANDLER_FILE_SIZE: u64 = 1024 * 1024;

/// Which table a handler was declared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    /// `[[tools]]`.
    Tool,
    /// `[[resources]]`.
    Resource,
    /// `[[prompts]]`.
    Prompt,
}

impl HandlerKind {
    /// Lowercase name used in logs and errors.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::Resource => "resource",
            Self::Prompt => "prompt",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared handler with its source already normalized.
#[derive(Debug, Clone)]
pub struct HandlerDef {
    /// Handler name.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Optional input schema.
    pub input_schema: Option<serde_json::Value>,
    /// Resource URI (resources only).
    pub uri: Option<String>,
    /// Normalized handler.
    pub handler: Handler,
}

/// A plugin the registry has accepted.
///
/// Immutable apart from its context, which starts bare and is replaced once
/// capabilities have been attached.
pub struct LoadedPlugin {
    manifest: PluginManifest,
    source_dir: PathBuf,
    tools: HashMap<String, HandlerDef>,
    resources: HashMap<String, HandlerDef>,
    prompts: HashMap<String, HandlerDef>,
    context: RwLock<Arc<PluginContext>>,
    loaded_at: DateTime<Utc>,
}

impl LoadedPlugin {
    /// Normalize every declared handler, reading `handler_file` sources from
    /// `source_dir`.
    ///
    /// # Errors
    ///
    /// - [`PluginError::InvalidManifest`] if a handler is not an accepted form
    ///   or its file escapes the plugin directory.
    /// - [`PluginError::LoadFailed`] if a handler file cannot be read.
    pub fn from_manifest(manifest: PluginManifest, source_dir: &Path) -> PluginResult<Self> {
        let tools = build_handlers(&manifest, source_dir, HandlerKind::Tool, &manifest.tools)?;
        let resources =
            build_handlers(&manifest, source_dir, HandlerKind::Resource, &manifest.resources)?;
        let prompts =
            build_handlers(&manifest, source_dir, HandlerKind::Prompt, &manifest.prompts)?;
        let context = RwLock::new(Arc::new(PluginContext::new(&manifest)));

        Ok(Self {
            manifest,
            source_dir: source_dir.to_path_buf(),
            tools,
            resources,
            prompts,
            context,
            loaded_at: Utc::now(),
        })
    }

    /// Plugin name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// The manifest the plugin was loaded from.
    #[must_use]
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    /// Directory the plugin was loaded from.
    #[must_use]
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// When the registry accepted this definition.
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Look up a handler by kind and name.
    #[must_use]
    pub fn handler(&self, kind: HandlerKind, name: &str) -> Option<&HandlerDef> {
        self.handlers(kind).get(name)
    }

    /// All handlers of one kind.
    #[must_use]
    pub fn handlers(&self, kind: HandlerKind) -> &HashMap<String, HandlerDef> {
        match kind {
            HandlerKind::Tool => &self.tools,
            HandlerKind::Resource => &self.resources,
            HandlerKind::Prompt => &self.prompts,
        }
    }

    /// Handler names of one kind, sorted.
    #[must_use]
    pub fn handler_names(&self, kind: HandlerKind) -> Vec<String> {
        let mut names: Vec<String> = self.handlers(kind).keys().cloned().collect();
        names.sort();
        names
    }

    /// The context handed to this plugin's handlers.
    #[must_use]
    pub fn context(&self) -> Arc<PluginContext> {
        let guard = self.context.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replace the context, typically with one carrying live capabilities.
    pub fn attach_context(&self, context: PluginContext) {
        let mut guard = self.context.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(context);
    }

    /// A serializable summary for listings.
    #[must_use]
    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            description: self.manifest.description.clone(),
            permissions: self.manifest.permissions.clone(),
            dependencies: self.manifest.dependencies.clone(),
            tools: self.handler_names(HandlerKind::Tool),
            resources: self.handler_names(HandlerKind::Resource),
            prompts: self.handler_names(HandlerKind::Prompt),
            source_dir: self.source_dir.clone(),
            loaded_at: self.loaded_at,
        }
    }
}

impl fmt::Debug for LoadedPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedPlugin")
            .field("name", &self.manifest.name)
            .field("version", &self.manifest.version)
            .field("source_dir", &self.source_dir)
            .field("tools", &self.tools.len())
            .field("resources", &self.resources.len())
            .field("prompts", &self.prompts.len())
            .finish_non_exhaustive()
    }
}

/// What `list_plugins` reports for one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    /// Plugin name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Optional description.
    pub description: Option<String>,
    /// Granted permissions.
    pub permissions: Vec<Permission>,
    /// Declared dependencies.
    pub dependencies: Vec<String>,
    /// Tool names, sorted.
    pub tools: Vec<String>,
    /// Resource names, sorted.
    pub resources: Vec<String>,
    /// Prompt names, sorted.
    pub prompts: Vec<String>,
    /// Directory the plugin was loaded from.
    pub source_dir: PathBuf,
    /// When it was loaded.
    pub loaded_at: DateTime<Utc>,
}

fn build_handlers(
    manifest: &PluginManifest,
    source_dir: &Path,
    kind: HandlerKind,
    decls: &[HandlerDecl],
) -> PluginResult<HashMap<String, HandlerDef>> {
    let manifest_path = source_dir.join(MANIFEST_FILE_NAME);
    let mut out = HashMap::with_capacity(decls.len());

    for decl in decls {
        let raw = match (&decl.handler, &decl.handler_file) {
            (Some(inline), _) => inline.clone(),
            (None, Some(file)) => read_handler_file(manifest, source_dir, file)?,
            (None, None) => {
                return Err(PluginError::InvalidManifest {
                    path: manifest_path,
                    message: format!("{kind} '{}' has no handler", decl.name),
                });
            },
        };
        let handler = Handler::normalize(&raw).map_err(|message| PluginError::InvalidManifest {
            path: manifest_path.clone(),
            message: format!("{kind} '{}': {message}", decl.name),
        })?;
        out.insert(
            decl.name.clone(),
            HandlerDef {
                name: decl.name.clone(),
                description: decl.description.clone(),
                input_schema: decl.input_schema.clone(),
                uri: decl.uri.clone(),
                handler,
            },
        );
    }
    Ok(out)
}

fn read_handler_file(
    manifest: &PluginManifest,
    source_dir: &Path,
    file: &Path,
) -> PluginResult<String> {
    let load_failed = |message: String| PluginError::LoadFailed {
        plugin: manifest.name.clone(),
        message,
    };

    let root = source_dir
        .canonicalize()
        .map_err(|e| load_failed(format!("plugin directory: {e}")))?;
    let path = root
        .join(file)
        .canonicalize()
        .map_err(|e| load_failed(format!("handler file {}: {e}", file.display())))?;
    if !path.starts_with(&root) {
        return Err(PluginError::InvalidManifest {
            path: source_dir.join(MANIFEST_FILE_NAME),
            message: format!(
                "handler file {} resolves outside the plugin directory",
                file.display()
            ),
        });
    }

    let size = std::fs::metadata(&path)
        .map_err(|e| load_failed(format!("handler file {}: {e}", file.display())))?
        .len();
    if size > MAX_HANDLER_FILE_SIZE {
        return Err(load_failed(format!(
            "handler file {} is {size} bytes, exceeding the {MAX_HANDLER_FILE_SIZE} byte limit",
            file.display()
        )));
    }
    std::fs::read_to_string(&path)
        .map_err(|e| load_failed(format!("handler file {}: {e}", file.display())))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use super::*;
    use crate::error::ErrorKind;
    use crate::handler::HandlerSource;

    fn manifest(text: &str) -> PluginManifest {
        PluginManifest::from_toml(text, Path::new("plugin.toml")).unwrap()
    }

    #[test]
    fn test_inline_handlers_are_normalized() {
        let dir = TempDir::new().unwrap();
        let m = manifest(
            r#"
name = "demo"
version = "1.0.0"

[[tools]]
name = "add"
handler = "async function add(p) { return p.a + p.b; }"

[[resources]]
name = "status"
uri = "demo://status"
handler = "() => ({ ok: true })"

[[prompts]]
name = "greet"
handler = "function (p) { return 'hi ' + p.name; }"
"#,
        );
        let plugin = LoadedPlugin::from_manifest(m, dir.path()).unwrap();

        let add = plugin.handler(HandlerKind::Tool, "add").unwrap();
        assert_eq!(
            add.handler.source(),
            &HandlerSource::NamedFunction {
                name: "add".into(),
                is_async: true
            }
        );
        let status = plugin.handler(HandlerKind::Resource, "status").unwrap();
        assert_eq!(status.uri.as_deref(), Some("demo://status"));
        assert!(plugin.handler(HandlerKind::Prompt, "greet").is_some());
        assert!(plugin.handler(HandlerKind::Tool, "greet").is_none());
    }

    #[test]
    fn test_handler_file_is_read() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("tools")).unwrap();
        std::fs::write(
            dir.path().join("tools/echo.js"),
            "function echo(params) { return params; }\n",
        )
        .unwrap();
        let m = manifest(
            r#"
name = "demo"
version = "1.0.0"

[[tools]]
name = "echo"
handler_file = "tools/echo.js"
"#,
        );
        let plugin = LoadedPlugin::from_manifest(m, dir.path()).unwrap();
        let echo = plugin.handler(HandlerKind::Tool, "echo").unwrap();
        assert!(echo.handler.invocable().contains("return echo;"));
    }

    #[test]
    fn test_missing_handler_file_fails_load() {
        let dir = TempDir::new().unwrap();
        let m = manifest(
            r#"
name = "demo"
version = "1.0.0"

[[tools]]
name = "echo"
handler_file = "nope.js"
"#,
        );
        let err = LoadedPlugin::from_manifest(m, dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::LoadFailed { .. }));
        assert_eq!(err.kind(), ErrorKind::LoadError);
    }

    #[test]
    fn test_unrecognized_handler_form_is_rejected() {
        let dir = TempDir::new().unwrap();
        let m = manifest(
            r#"
name = "demo"
version = "1.0.0"

[[tools]]
name = "bad"
handler = "return 42;"
"#,
        );
        let err = LoadedPlugin::from_manifest(m, dir.path()).unwrap_err();
        assert!(matches!(err, PluginError::InvalidManifest { .. }));
        assert!(err.to_string().contains("tool 'bad'"));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_handler_outside_dir_is_rejected() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("evil.js"), "() => 1").unwrap();
        let dir = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path().join("evil.js"), dir.path().join("link.js"))
            .unwrap();
        let m = manifest(
            r#"
name = "demo"
version = "1.0.0"

[[tools]]
name = "t"
handler_file = "link.js"
"#,
        );
        let err = LoadedPlugin::from_manifest(m, dir.path()).unwrap_err();
        assert!(err.to_string().contains("outside the plugin directory"));
    }

    #[test]
    fn test_attach_context_replaces_snapshot() {
        let dir = TempDir::new().unwrap();
        let m = manifest("name = \"demo\"\nversion = \"1.0.0\"\n");
        let plugin = LoadedPlugin::from_manifest(m.clone(), dir.path()).unwrap();

        let before = plugin.context();
        assert!(before.storage().is_none());

        let mut ctx = PluginContext::new(&m);
        ctx.storage = Some(crate::capabilities::StorageCapability::new(
            "demo",
            Arc::new(crate::capabilities::KvStore::new()),
        ));
        plugin.attach_context(ctx);

        assert!(plugin.context().storage().is_some());
        assert!(before.storage().is_none());
    }

    #[test]
    fn test_summary_sorts_names() {
        let dir = TempDir::new().unwrap();
        let m = manifest(
            r#"
name = "demo"
version = "2.0.0"
permissions = ["sheets.read"]

[[tools]]
name = "zeta"
handler = "() => 1"

[[tools]]
name = "alpha"
handler = "() => 2"
"#,
        );
        let summary = LoadedPlugin::from_manifest(m, dir.path()).unwrap().summary();
        assert_eq!(summary.tools, vec!["alpha", "zeta"]);
        assert_eq!(summary.permissions, vec![Permission::SheetsRead]);
        assert_eq!(summary.version, "2.0.0");
    }
}
