//! Persisted record of installed tools.
//!
//! The registry is a JSON document at `<root>/.registry`:
//!
//! ```json
//! {
//!   "version": 1,
//!   "tools": {
//!     "slc-cli": {
//!       "4.2.0": { "tool": "slc-cli", "version": "4.2.0", "executable_path": "...", ... }
//!     }
//!   }
//! }
//! ```
//!
//! Unknown fields are ignored so older binaries can read newer registries.
//! Every mutation holds `<root>/.registry.lock` for its read-modify-write and
//! replaces the file by atomic rename, so readers never see a torn write.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::layout::{ToolsLayout, validate_component};
use crate::lock::FileLock;
use crate::platform::PlatformKey;
use crate::{Error, Result};

/// Current registry format version.
pub const REGISTRY_VERSION: u32 = 1;

/// One installed `(tool, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledTool {
    /// Tool name.
    pub tool: String,
    /// Installed version.
    pub version: String,
    /// Absolute path of the executable inside the managed root.
    pub executable_path: PathBuf,
    /// When the install completed.
    pub installed_at: DateTime<Utc>,
    /// Whether the artifact matched a catalogued checksum.
    #[serde(default)]
    pub checksum_verified: bool,
    /// Platform the artifact was built for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformKey>,
    /// URL the artifact was downloaded from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// SHA-256 of the downloaded artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_sha256: Option<String>,
    /// Size of the executable at install time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_size: Option<u64>,
    /// SHA-256 of the executable at install time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable_sha256: Option<String>,
}

impl InstalledTool {
    /// Create a record with only the required fields set.
    #[must_use]
    pub fn new(
        tool: impl Into<String>,
        version: impl Into<String>,
        executable_path: impl Into<PathBuf>,
        checksum_verified: bool,
    ) -> Self {
        Self {
            tool: tool.into(),
            version: version.into(),
            executable_path: executable_path.into(),
            installed_at: Utc::now(),
            checksum_verified,
            platform: None,
            source_url: None,
            artifact_sha256: None,
            executable_size: None,
            executable_sha256: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default = "registry_version")]
    version: u32,
    #[serde(default)]
    tools: BTreeMap<String, BTreeMap<String, InstalledTool>>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            tools: BTreeMap::new(),
        }
    }
}

const fn registry_version() -> u32 {
    REGISTRY_VERSION
}

/// Installed-tool registry rooted in a [`ToolsLayout`].
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    layout: ToolsLayout,
}

impl ToolRegistry {
    /// Registry for the managed root described by `layout`.
    #[must_use]
    pub fn new(layout: ToolsLayout) -> Self {
        Self { layout }
    }

    /// The managed-root layout.
    #[must_use]
    pub fn layout(&self) -> &ToolsLayout {
        &self.layout
    }

    /// The persisted record for `(tool, version)`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if the registry file is unreadable.
    pub fn lookup(&self, tool: &str, version: &str) -> Result<Option<InstalledTool>> {
        let mut file = self.load()?;
        Ok(file
            .tools
            .get_mut(tool)
            .and_then(|versions| versions.remove(version)))
    }

    /// Every record, ordered by tool then version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if the registry file is unreadable.
    pub fn list(&self) -> Result<Vec<InstalledTool>> {
        Ok(self
            .load()?
            .tools
            .into_values()
            .flat_map(BTreeMap::into_values)
            .collect())
    }

    /// Records for every installed version of `tool`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if the registry file is unreadable.
    pub fn installed_versions(&self, tool: &str) -> Result<Vec<InstalledTool>> {
        Ok(self
            .load()?
            .tools
            .remove(tool)
            .map(|versions| versions.into_values().collect())
            .unwrap_or_default())
    }

    /// Cheap validity check: the executable lies inside the root, exists,
    /// and still has its recorded size.
    #[must_use]
    pub fn is_valid(&self, entry: &InstalledTool) -> bool {
        let path = &entry.executable_path;
        if !self.layout.contains(path) {
            warn!(tool = %entry.tool, version = %entry.version, path = %path.display(), "Registry entry points outside the managed root");
            return false;
        }
        let Ok(metadata) = std::fs::metadata(path) else {
            debug!(tool = %entry.tool, version = %entry.version, path = %path.display(), "Executable missing");
            return false;
        };
        if !metadata.is_file() {
            return false;
        }
        match entry.executable_size {
            Some(size) if size != metadata.len() => {
                debug!(tool = %entry.tool, version = %entry.version, expected = size, actual = metadata.len(), "Executable size changed");
                false
            }
            _ => true,
        }
    }

    /// Full check: [`is_valid`](Self::is_valid) plus a hash of the executable
    /// against the recorded digest.
    #[must_use]
    pub fn verify(&self, entry: &InstalledTool) -> bool {
        if !self.is_valid(entry) {
            return false;
        }
        let Some(expected) = &entry.executable_sha256 else {
            return true;
        };
        match crate::sha256_file(&entry.executable_path) {
            Ok(actual) if actual == *expected => true,
            Ok(actual) => {
                warn!(tool = %entry.tool, version = %entry.version, %expected, %actual, "Executable checksum mismatch");
                false
            }
            Err(e) => {
                debug!(tool = %entry.tool, version = %entry.version, error = %e, "Could not hash executable");
                false
            }
        }
    }

    /// Persist `entry`, replacing any record for the same `(tool, version)`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] if the executable lies outside the managed
    /// root or the registry cannot be written.
    pub fn record(&self, entry: InstalledTool) -> Result<()> {
        if !self.layout.contains(&entry.executable_path) {
            return Err(Error::registry(
                self.layout.registry_file(),
                format!(
                    "Refusing to record {} {}: {} is outside the managed root {}",
                    entry.tool,
                    entry.version,
                    entry.executable_path.display(),
                    self.layout.root().display()
                ),
            ));
        }

        self.update(|file| {
            info!(
                tool = %entry.tool,
                version = %entry.version,
                path = %entry.executable_path.display(),
                "Recorded installed tool"
            );
            file.tools
                .entry(entry.tool.clone())
                .or_default()
                .insert(entry.version.clone(), entry);
        })
    }

    /// Remove the record for `(tool, version)` and delete its install slot.
    ///
    /// The slot is removed even when no record exists, which clears out
    /// orphaned directories before a reinstall.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `tool` or `version` is not a plain
    /// name, [`Error::Registry`] if the registry cannot be written, or an
    /// I/O error if the slot cannot be deleted.
    pub fn remove(&self, tool: &str, version: &str) -> Result<Option<InstalledTool>> {
        validate_component("tool", tool)?;
        validate_component("version", version)?;

        let removed = self.update(|file| {
            let removed = file
                .tools
                .get_mut(tool)
                .and_then(|versions| versions.remove(version));
            if file.tools.get(tool).is_some_and(BTreeMap::is_empty) {
                file.tools.remove(tool);
            }
            removed
        })?;

        self.delete_slot(tool, version)?;
        if removed.is_some() {
            info!(%tool, %version, "Removed installed tool");
        }
        Ok(removed)
    }

    /// Move the slot out of the way, then delete it.
    fn delete_slot(&self, tool: &str, version: &str) -> Result<()> {
        let slot = self.layout.slot_dir(tool, version);
        if !self.layout.contains(&slot) || slot == self.layout.root() {
            return Err(Error::configuration(format!(
                "Refusing to delete {}: not an install slot under {}",
                slot.display(),
                self.layout.root().display()
            )));
        }
        if !slot.exists() {
            return Ok(());
        }

        self.layout.ensure_dirs()?;
        let scratch = self.layout.scratch_dir();
        let trash = tempfile::Builder::new()
            .prefix("removed-")
            .tempdir_in(&scratch)
            .map_err(|e| Error::io(e, &scratch, "create trash dir"))?;
        std::fs::rename(&slot, trash.path().join("slot"))
            .map_err(|e| Error::io(e, &slot, "rename"))?;
        trash
            .close()
            .map_err(|e| Error::io(e, &scratch, "remove_dir_all"))?;

        // Leave the tool directory only if other versions remain.
        let tool_dir = self.layout.tool_dir(tool);
        if let Ok(mut entries) = std::fs::read_dir(&tool_dir)
            && entries.next().is_none()
        {
            let _ = std::fs::remove_dir(&tool_dir);
        }
        Ok(())
    }

    fn load(&self) -> Result<RegistryFile> {
        load_file(&self.layout.registry_file())
    }

    /// Run `f` on the registry under the registry lock and save the result.
    fn update<R>(&self, f: impl FnOnce(&mut RegistryFile) -> R) -> Result<R> {
        std::fs::create_dir_all(self.layout.root())
            .map_err(|e| Error::io(e, self.layout.root(), "create_dir_all"))?;
        let _lock = FileLock::exclusive(&self.layout.registry_lock_file())?;

        let path = self.layout.registry_file();
        let mut file = load_file(&path)?;
        let out = f(&mut file);
        file.version = file.version.max(REGISTRY_VERSION);
        save_file(&path, &file)?;
        Ok(out)
    }
}

fn load_file(path: &Path) -> Result<RegistryFile> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(RegistryFile::default()),
        Err(e) => return Err(Error::registry(path, format!("Failed to read: {e}"))),
    };
    if contents.trim().is_empty() {
        return Ok(RegistryFile::default());
    }
    let file: RegistryFile = serde_json::from_str(&contents)
        .map_err(|e| Error::registry(path, format!("Failed to parse: {e}")))?;
    if file.version > REGISTRY_VERSION {
        debug!(found = file.version, supported = REGISTRY_VERSION, "Registry written by a newer version");
    }
    Ok(file)
}

fn save_file(path: &Path, file: &RegistryFile) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| Error::registry(path, "Registry path has no parent directory"))?;
    let contents = serde_json::to_string_pretty(file)
        .map_err(|e| Error::registry(path, format!("Failed to serialize: {e}")))?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| Error::registry(path, format!("Failed to create temp file: {e}")))?;
    temp.write_all(contents.as_bytes())
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| Error::registry(path, format!("Failed to write: {e}")))?;
    temp.persist(path)
        .map_err(|e| Error::registry(path, format!("Failed to replace: {}", e.error)))?;
    debug!(path = %path.display(), "Saved registry");
    Ok(())
}
