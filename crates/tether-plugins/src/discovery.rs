//! Filesystem discovery of `plugin.toml` manifests.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{PluginError, PluginResult};
use crate::manifest::{MANIFEST_FILE_NAME, MAX_MANIFEST_SIZE, PluginManifest};

/// A manifest found on disk, parsed but not loaded.
#[derive(Debug)]
pub struct DiscoveredPlugin {
    /// The plugin directory (contains `plugin.toml`).
    pub dir: PathBuf,
    /// The parsed manifest, or why it could not be parsed.
    pub manifest: PluginResult<PluginManifest>,
}

impl DiscoveredPlugin {
    /// The manifest name, if it parsed.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.manifest.as_ref().ok().map(|m| m.name.as_str())
    }
}

/// Resolve a user-supplied path (plugin directory or manifest file) into
/// `(manifest_path, plugin_dir)`.
#[must_use]
pub fn resolve_manifest_path(path: &Path) -> (PathBuf, PathBuf) {
    if path.is_dir() {
        (path.join(MANIFEST_FILE_NAME), path.to_path_buf())
    } else {
        let dir = path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        (path.to_path_buf(), dir)
    }
}

/// Read and validate a single manifest file.
///
/// # Errors
///
/// Returns [`PluginError::InvalidManifest`] if the file is missing, too
/// large, unparsable, or fails validation.
pub fn load_manifest(path: &Path) -> PluginResult<PluginManifest> {
    let invalid = |message: String| PluginError::InvalidManifest {
        path: path.to_path_buf(),
        message,
    };

    let metadata = std::fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
    if metadata.len() > MAX_MANIFEST_SIZE {
        return Err(invalid(format!(
            "manifest is {} bytes, exceeding the {MAX_MANIFEST_SIZE} byte limit",
            metadata.len()
        )));
    }
    let text = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
    PluginManifest::from_toml(&text, path)
}

/// Scan the immediate subdirectories of `root` for plugin manifests.
///
/// Results are sorted by directory path. A missing `root` yields an empty
/// list. Unparsable manifests are returned with their error rather than
/// dropped, so callers can report them.
///
/// # Errors
///
/// Returns an I/O error if `root` exists but cannot be read.
pub fn discover_manifests(root: &Path) -> PluginResult<Vec<DiscoveredPlugin>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(root = %root.display(), "plugin directory does not exist");
            return Ok(Vec::new());
        },
        Err(e) => return Err(PluginError::Io(e)),
    };

    let mut found = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let dir = entry.path();
        let manifest_path = dir.join(MANIFEST_FILE_NAME);
        if !manifest_path.is_file() {
            continue;
        }
        let manifest = load_manifest(&manifest_path);
        if let Err(e) = &manifest {
            warn!(dir = %dir.display(), error = %e, "skipping invalid plugin manifest");
        }
        found.push(DiscoveredPlugin { dir, manifest });
    }

    found.sort_by(|a, b| a.dir.cmp(&b.dir));
    debug!(root = %root.display(), count = found.len(), "discovered plugin manifests");
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_plugin(root: &Path, dir: &str, manifest: &str) -> PathBuf {
        let path = root.join(dir);
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join(MANIFEST_FILE_NAME), manifest).unwrap();
        path
    }

    #[test]
    fn test_discover_sorted_and_reports_invalid() {
        let root = TempDir::new().unwrap();
        write_plugin(root.path(), "b-plugin", "name = \"b\"\nversion = \"1\"\n");
        write_plugin(root.path(), "a-plugin", "name = \"a\"\nversion = \"1\"\n");
        write_plugin(root.path(), "broken", "name = ");
        std::fs::create_dir(root.path().join("no-manifest")).unwrap();
        std::fs::write(root.path().join("stray.toml"), "x = 1").unwrap();

        let found = discover_manifests(root.path()).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].name(), Some("a"));
        assert_eq!(found[1].name(), Some("b"));
        assert!(found[2].manifest.is_err());
    }

    #[test]
    fn test_discover_missing_root() {
        let found = discover_manifests(Path::new("/nonexistent/tether/plugins")).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_resolve_manifest_path() {
        let root = TempDir::new().unwrap();
        let dir = write_plugin(root.path(), "p", "name = \"p\"\nversion = \"1\"\n");

        let (manifest, plugin_dir) = resolve_manifest_path(&dir);
        assert_eq!(manifest, dir.join(MANIFEST_FILE_NAME));
        assert_eq!(plugin_dir, dir);

        let (manifest, plugin_dir) = resolve_manifest_path(&dir.join(MANIFEST_FILE_NAME));
        assert_eq!(manifest, dir.join(MANIFEST_FILE_NAME));
        assert_eq!(plugin_dir, dir);
    }

    #[test]
    fn test_load_manifest_too_large() {
        let root = TempDir::new().unwrap();
        let padding = "#".repeat(usize::try_from(MAX_MANIFEST_SIZE).unwrap() + 1);
        let dir = write_plugin(root.path(), "big", &padding);
        let err = load_manifest(&dir.join(MANIFEST_FILE_NAME)).unwrap_err();
        assert!(err.to_string().contains("byte limit"));
    }

    #[test]
    fn test_load_manifest_missing_file() {
        let err = load_manifest(Path::new("/nonexistent/plugin.toml")).unwrap_err();
        assert!(matches!(err, PluginError::InvalidManifest { .. }));
    }
}
