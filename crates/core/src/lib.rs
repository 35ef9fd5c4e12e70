//! Core types for simplicity-tools.
//!
//! This crate holds everything the provisioning pipeline agrees on:
//!
//! - [`platform`] - canonical `(os, arch)` detection and per-platform capabilities
//! - [`catalog`] - the static table mapping `(tool, version, platform)` to artifacts
//! - [`registry`] - persisted record of installed tools
//! - [`layout`] - paths inside the managed root directory
//! - [`lock`] - advisory per-slot install locks
//! - [`Error`] - the error taxonomy shared by every stage
//!
//! Downloading and extraction live in `simplicity-install`; the runner and CLI
//! live in `simplicity-tools`.

pub mod catalog;
mod error;
pub mod layout;
pub mod lock;
pub mod platform;
pub mod registry;

pub use catalog::{ArchiveKind, ArtifactCatalog, ArtifactDescriptor, VersionSpec};
pub use error::{Error, Result, Stage};
pub use layout::{ROOT_ENV_VAR, ToolsLayout, default_root, root_from_env, validate_component};
pub use lock::SlotLock;
pub use platform::{Arch, Os, PlatformCapabilities, PlatformDetector, PlatformKey};
pub use registry::{InstalledTool, ToolRegistry};

/// Compute the hex-encoded SHA-256 of a byte slice.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(data))
}

/// Compute the hex-encoded SHA-256 of a file, streaming it in fixed-size chunks.
///
/// # Errors
///
/// Returns an I/O error if the file cannot be opened or read.
pub fn sha256_file(path: &std::path::Path) -> std::io::Result<String> {
    use sha2::{Digest, Sha256};
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Normalize a checksum string for comparison.
///
/// Accepts `sha256:<hex>` or bare hex in any case.
#[must_use]
pub fn normalize_checksum(checksum: &str) -> String {
    let trimmed = checksum.trim();
    let hex = match trimmed.split_once(':') {
        Some((algo, hash)) if algo.eq_ignore_ascii_case("sha256") => hash,
        _ => trimmed,
    };
    hex.to_ascii_lowercase()
}
