//! Error types for tool provisioning.
//!
//! Every tool-scoped error names the tool, version and platform it was
//! processing; [`Error::stage`] tells the caller which part of the pipeline
//! failed.

use miette::Diagnostic;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Result type for simplicity-tools operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Host platform detection.
    Detect,
    /// Catalog resolution.
    Resolve,
    /// Artifact download and verification.
    Download,
    /// Extraction and placement into the managed root.
    Install,
    /// Waiting for another installer of the same slot.
    Lock,
    /// Executing the installed tool.
    Run,
    /// Reading or writing the registry file.
    Registry,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Detect => "detect",
            Self::Resolve => "resolve",
            Self::Download => "download",
            Self::Install => "install",
            Self::Lock => "lock",
            Self::Run => "run",
            Self::Registry => "registry",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while provisioning or running a tool.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// The host (or requested) platform is not covered.
    #[error("Unsupported platform {platform}{}", for_tool(.tool.as_deref(), .version.as_deref()))]
    #[diagnostic(
        code(simplicity::unsupported_platform),
        help("No artifact is published for this OS/architecture combination")
    )]
    UnsupportedPlatform {
        /// Platform string (canonical key or raw host identifiers).
        platform: String,
        /// Tool being resolved, if resolution had started.
        tool: Option<String>,
        /// Version being resolved, if known.
        version: Option<String>,
    },

    /// The tool is not in the catalog.
    #[error("Unknown tool '{tool}' (known tools: {})", .known.join(", "))]
    #[diagnostic(code(simplicity::unknown_tool))]
    UnknownTool {
        /// Requested tool name.
        tool: String,
        /// Tools the catalog does know.
        known: Vec<String>,
    },

    /// The version is not in the catalog for this tool.
    #[error("Unknown version '{version}' for tool '{tool}' (available: {})", .available.join(", "))]
    #[diagnostic(
        code(simplicity::unknown_version),
        help("Run `simplicity-tools versions <tool>` to list catalogued versions")
    )]
    UnknownVersion {
        /// Tool name.
        tool: String,
        /// Requested version.
        version: String,
        /// Versions the catalog knows for this tool.
        available: Vec<String>,
    },

    /// Network-layer failure after retries were exhausted.
    #[error(
        "Download of {tool} {version} ({platform}) from {url} failed after {attempts} attempt(s): {message}"
    )]
    #[diagnostic(
        code(simplicity::download),
        help("Check your network connection and try again")
    )]
    Download {
        /// Tool name.
        tool: String,
        /// Tool version.
        version: String,
        /// Target platform.
        platform: String,
        /// URL that was fetched.
        url: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last underlying cause.
        message: String,
    },

    /// Downloaded content did not match the catalogued checksum.
    #[error(
        "Checksum mismatch for {tool} {version} ({platform}) from {url}: expected {expected}, got {actual}"
    )]
    #[diagnostic(
        code(simplicity::integrity),
        help("The mirror may be corrupted or tampered with; the artifact was discarded")
    )]
    Integrity {
        /// Tool name.
        tool: String,
        /// Tool version.
        version: String,
        /// Target platform.
        platform: String,
        /// URL that was fetched.
        url: String,
        /// Expected SHA-256.
        expected: String,
        /// Computed SHA-256.
        actual: String,
    },

    /// Extraction or placement failed. Staging has been rolled back.
    #[error("Install of {tool} {version} ({platform}) failed: {message}")]
    #[diagnostic(code(simplicity::install))]
    Install {
        /// Tool name.
        tool: String,
        /// Tool version.
        version: String,
        /// Target platform.
        platform: String,
        /// What went wrong.
        message: String,
    },

    /// Another process held the install lock for too long.
    #[error("Timed out after {waited_secs}s waiting for the install lock on {tool} {version}")]
    #[diagnostic(
        code(simplicity::lock_timeout),
        help("Another process is installing this tool; retry once it finishes")
    )]
    LockTimeout {
        /// Tool name.
        tool: String,
        /// Tool version.
        version: String,
        /// Seconds spent waiting.
        waited_secs: u64,
    },

    /// The caller cancelled the operation or its timeout elapsed.
    #[error("Cancelled during {stage} of {tool}{}: {reason}", for_version(.version.as_deref()))]
    #[diagnostic(code(simplicity::cancelled))]
    Cancelled {
        /// Tool name.
        tool: String,
        /// Tool version, if resolved.
        version: Option<String>,
        /// Stage that was interrupted.
        stage: Stage,
        /// Why (cancellation signal or timeout).
        reason: String,
    },

    /// The tool process could not be started.
    #[error("Failed to run {tool} {version}: {message}")]
    #[diagnostic(code(simplicity::run))]
    Run {
        /// Tool name.
        tool: String,
        /// Tool version.
        version: String,
        /// What went wrong.
        message: String,
    },

    /// The registry file could not be read or written.
    #[error("Registry error at {}: {message}", .path.display())]
    #[diagnostic(code(simplicity::registry))]
    Registry {
        /// Path of the registry file.
        path: Box<Path>,
        /// What went wrong.
        message: String,
    },

    /// Invalid configuration (catalog file, managed root).
    #[error("Configuration error: {0}")]
    #[diagnostic(code(simplicity::config))]
    Configuration(String),

    /// I/O error with the operation and path involved.
    #[error("I/O {operation} failed{}: {source}", on_path(.path.as_deref()))]
    #[diagnostic(code(simplicity::io))]
    Io {
        /// Underlying error.
        #[source]
        source: std::io::Error,
        /// Path involved, if any.
        path: Option<Box<Path>>,
        /// Operation name (e.g. `create_dir_all`).
        operation: String,
    },
}

fn for_tool(tool: Option<&str>, version: Option<&str>) -> String {
    match (tool, version) {
        (Some(t), Some(v)) => format!(" for {t} {v}"),
        (Some(t), None) => format!(" for {t}"),
        _ => String::new(),
    }
}

fn for_version(version: Option<&str>) -> String {
    version.map(|v| format!(" {v}")).unwrap_or_default()
}

fn on_path(path: Option<&Path>) -> String {
    path.map(|p| format!(" on {}", p.display()))
        .unwrap_or_default()
}

impl Error {
    /// Create a configuration error.
    #[must_use]
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create an I/O error with context.
    #[must_use]
    pub fn io(source: std::io::Error, path: impl AsRef<Path>, operation: impl Into<String>) -> Self {
        Self::Io {
            source,
            path: Some(path.as_ref().into()),
            operation: operation.into(),
        }
    }

    /// Create a registry error.
    #[must_use]
    pub fn registry(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::Registry {
            path: path.as_ref().into(),
            message: message.into(),
        }
    }

    /// The pipeline stage this error belongs to.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Self::UnsupportedPlatform { tool: None, .. } => Stage::Detect,
            Self::UnsupportedPlatform { .. }
            | Self::UnknownTool { .. }
            | Self::UnknownVersion { .. }
            | Self::Configuration(_) => Stage::Resolve,
            Self::Download { .. } | Self::Integrity { .. } => Stage::Download,
            Self::Install { .. } | Self::Io { .. } => Stage::Install,
            Self::LockTimeout { .. } => Stage::Lock,
            Self::Cancelled { stage, .. } => *stage,
            Self::Run { .. } => Stage::Run,
            Self::Registry { .. } => Stage::Registry,
        }
    }

    /// The tool this error concerns, if any.
    #[must_use]
    pub fn tool(&self) -> Option<&str> {
        match self {
            Self::UnsupportedPlatform { tool, .. } => tool.as_deref(),
            Self::UnknownTool { tool, .. }
            | Self::UnknownVersion { tool, .. }
            | Self::Download { tool, .. }
            | Self::Integrity { tool, .. }
            | Self::Install { tool, .. }
            | Self::LockTimeout { tool, .. }
            | Self::Cancelled { tool, .. }
            | Self::Run { tool, .. } => Some(tool),
            Self::Registry { .. } | Self::Configuration(_) | Self::Io { .. } => None,
        }
    }

    /// Whether a caller may reasonably retry the same request.
    ///
    /// Integrity failures are deliberately excluded.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Download { .. } | Self::LockTimeout { .. })
    }

    /// Whether this error is a caller-initiated cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
