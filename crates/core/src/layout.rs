//! Paths inside the managed root directory.
//!
//! ```text
//! <root>/
//! ├── .registry           # installed tool records (JSON)
//! ├── .registry.lock      # serializes registry read-modify-write
//! ├── .scratch/           # downloads, staging dirs, slot locks; safe to delete when idle
//! └── <tool>/
//!     └── <version>/
//!         └── <executable>
//! ```
//!
//! The root is an explicit value. Only the outermost boundary (the CLI) calls
//! [`root_from_env`]; components receive a [`ToolsLayout`].

use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// Environment variable overriding the managed root.
pub const ROOT_ENV_VAR: &str = "SIMPLICITY_TOOLS_DIR";

/// Directory name used under the home directory when no override is set.
pub const DEFAULT_DIR_NAME: &str = ".simplicity-tools";

const REGISTRY_FILE: &str = ".registry";
const REGISTRY_LOCK_FILE: &str = ".registry.lock";
const SCRATCH_DIR: &str = ".scratch";

/// Default managed root: `~/.simplicity-tools`.
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn default_root() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_DIR_NAME))
        .ok_or_else(|| Error::configuration("Could not determine home directory"))
}

/// Managed root from [`ROOT_ENV_VAR`], falling back to [`default_root`].
///
/// An empty variable is treated as unset.
///
/// # Errors
///
/// Returns an error if the variable is unset and the home directory cannot be
/// determined.
pub fn root_from_env() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ROOT_ENV_VAR)
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    default_root()
}

/// Path layout of a managed root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolsLayout {
    root: PathBuf,
}

impl ToolsLayout {
    /// Create a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The managed root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The registry file.
    #[must_use]
    pub fn registry_file(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    /// Lock file guarding registry updates.
    #[must_use]
    pub fn registry_lock_file(&self) -> PathBuf {
        self.root.join(REGISTRY_LOCK_FILE)
    }

    /// Scratch directory for downloads and staging.
    #[must_use]
    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(SCRATCH_DIR)
    }

    /// Directory holding every installed version of `tool`.
    #[must_use]
    pub fn tool_dir(&self, tool: &str) -> PathBuf {
        self.root.join(tool)
    }

    /// Final install slot `<root>/<tool>/<version>`.
    #[must_use]
    pub fn slot_dir(&self, tool: &str, version: &str) -> PathBuf {
        self.tool_dir(tool).join(version)
    }

    /// Advisory lock file for a `(tool, version)` slot.
    #[must_use]
    pub fn slot_lock_file(&self, tool: &str, version: &str) -> PathBuf {
        self.scratch_dir().join(format!("{tool}@{version}.lock"))
    }

    /// Create the root and scratch directories.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directories cannot be created.
    pub fn ensure_dirs(&self) -> Result<()> {
        let scratch = self.scratch_dir();
        std::fs::create_dir_all(&scratch).map_err(|e| Error::io(e, &scratch, "create_dir_all"))
    }

    /// Whether `path` lies inside the managed root.
    ///
    /// Paths are compared lexically; `..` components are rejected outright.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
            && !path
                .components()
                .any(|c| matches!(c, Component::ParentDir))
    }
}

/// Validate a tool or version name used as a single path component.
///
/// # Errors
///
/// Returns a configuration error for empty names, names starting with a dot,
/// and names containing a separator or a drive prefix.
pub fn validate_component(kind: &str, value: &str) -> Result<()> {
    let invalid = value.is_empty()
        || value == "."
        || value == ".."
        || value.starts_with('.')
        || value.contains(['/', '\\', ':', '\0']);
    if invalid {
        return Err(Error::configuration(format!(
            "Invalid {kind} name '{value}'"
        )));
    }
    Ok(())
}
