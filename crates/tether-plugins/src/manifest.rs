//! Plugin manifest types.
//!
//! A plugin manifest (`plugin.toml`) declares a plugin's identity, the
//! permissions it requests, the plugins it depends on, and its tool,
//! resource and prompt handlers. Manifests are immutable once loaded.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PluginError, PluginResult};

/// File name of a plugin manifest inside its plugin directory.
pub const MANIFEST_FILE_NAME: &str = "plugin.toml";

/// Manifests larger than this are rejected before parsing (256 KiB).
pub const MAX_MANIFEST_SIZE: u64 = 262_144;

/// A permission grant from the fixed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Permission {
    /// `sheets.read`: sheets `get` and `batchGet`.
    SheetsRead,
    /// `sheets.write`: sheets `update` and `batchUpdate`.
    SheetsWrite,
    /// `sheets.create`: sheets `create`.
    SheetsCreate,
    /// `drive.read`: drive `get` and `list`.
    DriveRead,
    /// `drive.write`: drive `create`, `update` and `delete`.
    DriveWrite,
    /// `network.fetch`: outbound requests.
    NetworkFetch,
}

impl Permission {
    /// Every permission in the vocabulary.
    pub const ALL: [Self; 6] = [
        Self::SheetsRead,
        Self::SheetsWrite,
        Self::SheetsCreate,
        Self::DriveRead,
        Self::DriveWrite,
        Self::NetworkFetch,
    ];

    /// The grant string as written in manifests.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SheetsRead => "sheets.read",
            Self::SheetsWrite => "sheets.write",
            Self::SheetsCreate => "sheets.create",
            Self::DriveRead => "drive.read",
            Self::DriveWrite => "drive.write",
            Self::NetworkFetch => "network.fetch",
        }
    }

    /// The backend namespace this permission gates (`sheets`, `drive`, `network`).
    #[must_use]
    pub fn backend(self) -> &'static str {
        match self {
            Self::SheetsRead | Self::SheetsWrite | Self::SheetsCreate => "sheets",
            Self::DriveRead | Self::DriveWrite => "drive",
            Self::NetworkFetch => "network",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown permission '{s}'"))
    }
}

impl TryFrom<String> for Permission {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Permission> for String {
    fn from(value: Permission) -> Self {
        value.as_str().to_owned()
    }
}

/// A tool, resource or prompt entry as declared in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerDecl {
    /// Name, unique within its kind.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Resource URI (resources only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Optional JSON schema for the handler's params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    /// Inline handler source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Handler source file, relative to the plugin directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler_file: Option<PathBuf>,
}

/// A plugin manifest loaded from `plugin.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Unique plugin name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Requested permission grants.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<Permission>,
    /// Plugins that must be loaded before this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    /// Arbitrary configuration, exposed to handlers as `context.config`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub config: HashMap<String, serde_json::Value>,
    /// Tool handlers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<HandlerDecl>,
    /// Resource handlers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<HandlerDecl>,
    /// Prompt handlers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prompts: Vec<HandlerDecl>,
}

impl PluginManifest {
    /// Parse a manifest from TOML text. `path` is only used for error messages.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidManifest`] if the text is not a valid
    /// manifest or fails [`validate`](Self::validate).
    pub fn from_toml(text: &str, path: &Path) -> PluginResult<Self> {
        let manifest: Self = toml::from_str(text).map_err(|e| PluginError::InvalidManifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        manifest.validate(path)?;
        Ok(manifest)
    }

    /// Whether the manifest requests `permission`.
    #[must_use]
    pub fn grants(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission)
    }

    /// Whether any permission for the given backend namespace is requested.
    #[must_use]
    pub fn grants_any(&self, backend: &str) -> bool {
        self.permissions.iter().any(|p| p.backend() == backend)
    }

    /// Structural validation that needs no filesystem access.
    ///
    /// # Errors
    ///
    /// Returns [`PluginError::InvalidManifest`] describing the first problem.
    pub fn validate(&self, path: &Path) -> PluginResult<()> {
        let invalid = |message: String| PluginError::InvalidManifest {
            path: path.to_path_buf(),
            message,
        };

        validate_name(&self.name).map_err(invalid)?;
        if self.version.trim().is_empty() {
            return Err(invalid("version must not be empty".into()));
        }

        for dep in &self.dependencies {
            validate_name(dep).map_err(|e| invalid(format!("dependency: {e}")))?;
            if dep == &self.name {
                return Err(invalid("a plugin cannot depend on itself".into()));
            }
        }

        for (kind, decls) in [
            ("tool", &self.tools),
            ("resource", &self.resources),
            ("prompt", &self.prompts),
        ] {
            let mut seen = HashSet::new();
            for decl in decls {
                if decl.name.trim().is_empty() {
                    return Err(invalid(format!("{kind} name must not be empty")));
                }
                if !seen.insert(decl.name.as_str()) {
                    return Err(invalid(format!("duplicate {kind} name '{}'", decl.name)));
                }
                match (&decl.handler, &decl.handler_file) {
                    (Some(_), None) => {},
                    (None, Some(file)) => {
                        if !is_relative_inside(file) {
                            return Err(invalid(format!(
                                "{kind} '{}': handler_file must be a relative path inside the plugin directory",
                                decl.name
                            )));
                        }
                    },
                    _ => {
                        return Err(invalid(format!(
                            "{kind} '{}' must declare exactly one of handler or handler_file",
                            decl.name
                        )));
                    },
                }
            }
        }

        Ok(())
    }
}

/// Check that a plugin name is non-empty lowercase alphanumeric plus inner hyphens.
///
/// # Errors
///
/// Returns a description of the problem.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("plugin name must not be empty".into());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "plugin name must contain only lowercase alphanumeric characters and hyphens, got: {name}"
        ));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(format!(
            "plugin name must not start or end with a hyphen, got: {name}"
        ));
    }
    Ok(())
}

/// Relative, no `..`, no root or prefix components.
fn is_relative_inside(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
name = "sheet-tools"
version = "0.1.0"
description = "Spreadsheet helpers"
permissions = ["sheets.read", "network.fetch"]
dependencies = ["base-utils"]

[config]
sheet = "abc"

[[tools]]
name = "read_range"
description = "Read a range"
input_schema = { type = "object" }
handler = "async function readRange(params, context) { return 1; }"

[[resources]]
name = "summary"
uri = "sheet://summary"
handler = "(params, context) => ({ ok: true })"

[[prompts]]
name = "describe"
handler_file = "prompts/describe.js"
"#;

    fn parse(text: &str) -> PluginResult<PluginManifest> {
        PluginManifest::from_toml(text, Path::new("plugin.toml"))
    }

    #[test]
    fn test_parse_full_manifest() {
        let m = parse(FULL).unwrap();
        assert_eq!(m.name, "sheet-tools");
        assert_eq!(
            m.permissions,
            vec![Permission::SheetsRead, Permission::NetworkFetch]
        );
        assert_eq!(m.dependencies, vec!["base-utils"]);
        assert_eq!(m.config["sheet"], serde_json::json!("abc"));
        assert_eq!(m.tools.len(), 1);
        assert_eq!(m.resources[0].uri.as_deref(), Some("sheet://summary"));
        assert_eq!(
            m.prompts[0].handler_file.as_deref(),
            Some(Path::new("prompts/describe.js"))
        );
    }

    #[test]
    fn test_minimal_manifest() {
        let m = parse("name = \"min\"\nversion = \"1\"\n").unwrap();
        assert!(m.permissions.is_empty());
        assert!(m.tools.is_empty());
    }

    #[test]
    fn test_grants() {
        let m = parse(FULL).unwrap();
        assert!(m.grants(Permission::SheetsRead));
        assert!(!m.grants(Permission::SheetsWrite));
        assert!(m.grants_any("sheets"));
        assert!(m.grants_any("network"));
        assert!(!m.grants_any("drive"));
    }

    #[test]
    fn test_unknown_permission_rejected() {
        let err = parse("name = \"p\"\nversion = \"1\"\npermissions = [\"sheets.admin\"]\n")
            .unwrap_err();
        assert!(err.to_string().contains("unknown permission"));
        assert_eq!(err.kind(), crate::ErrorKind::LoadError);
    }

    #[test]
    fn test_invalid_names_rejected() {
        for name in ["", "Upper", "-lead", "trail-", "has space", "dots.bad"] {
            let text = format!("name = \"{name}\"\nversion = \"1\"\n");
            assert!(parse(&text).is_err(), "name {name:?} should be rejected");
        }
    }

    #[test]
    fn test_empty_version_rejected() {
        assert!(parse("name = \"p\"\nversion = \"  \"\n").is_err());
    }

    #[test]
    fn test_duplicate_tool_rejected() {
        let text = r#"
name = "p"
version = "1"
[[tools]]
name = "a"
handler = "x => x"
[[tools]]
name = "a"
handler = "x => x"
"#;
        let err = parse(text).unwrap_err();
        assert!(err.to_string().contains("duplicate tool name"));
    }

    #[test]
    fn test_same_name_across_kinds_allowed() {
        let text = r#"
name = "p"
version = "1"
[[tools]]
name = "a"
handler = "x => x"
[[prompts]]
name = "a"
handler = "x => x"
"#;
        assert!(parse(text).is_ok());
    }

    #[test]
    fn test_handler_and_file_exclusive() {
        let both = r#"
name = "p"
version = "1"
[[tools]]
name = "a"
handler = "x => x"
handler_file = "a.js"
"#;
        assert!(parse(both).is_err());

        let neither = "name = \"p\"\nversion = \"1\"\n[[tools]]\nname = \"a\"\n";
        assert!(parse(neither).is_err());
    }

    #[test]
    fn test_handler_file_escape_rejected() {
        for file in ["../outside.js", "/etc/passwd", "a/../../b.js"] {
            let text =
                format!("name = \"p\"\nversion = \"1\"\n[[tools]]\nname = \"a\"\nhandler_file = \"{file}\"\n");
            assert!(parse(&text).is_err(), "{file} should be rejected");
        }
    }

    #[test]
    fn test_self_dependency_rejected() {
        assert!(parse("name = \"p\"\nversion = \"1\"\ndependencies = [\"p\"]\n").is_err());
    }

    #[test]
    fn test_permission_strings() {
        for p in Permission::ALL {
            assert_eq!(p.as_str().parse::<Permission>().unwrap(), p);
        }
        assert_eq!(Permission::DriveWrite.backend(), "drive");
    }

    #[test]
    fn test_manifest_toml_round_trip() {
        let mut m = parse(FULL).unwrap();
        m.tools[0].input_schema = None;
        let text = toml::to_string(&m).unwrap();
        assert!(text.contains("\"sheets.read\""));
        let again = parse(&text).unwrap();
        assert_eq!(again, m);
    }
}
