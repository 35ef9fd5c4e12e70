//! Platform detection and normalization.
//!
//! Maps the running host to a canonical [`PlatformKey`] from a fixed
//! enumeration. Raw identifiers from different sources (Rust target consts,
//! `uname -m`, vendor download pages) are normalized so that every alias of
//! an architecture lands on exactly one [`Arch`] value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::{Error, Result};

/// Operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Windows,
    Macos,
    Linux,
}

impl Os {
    /// Every supported operating system.
    pub const ALL: [Self; 3] = [Self::Windows, Self::Macos, Self::Linux];

    /// Parse from string, accepting common aliases.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "windows" | "win" | "win32" | "win64" => Some(Self::Windows),
            "macos" | "darwin" | "osx" | "mac" => Some(Self::Macos),
            "linux" => Some(Self::Linux),
            _ => None,
        }
    }

    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Macos => "macos",
            Self::Linux => "linux",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CPU architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X64,
    X86,
    Arm64,
    Arm32,
}

impl Arch {
    /// Every supported architecture.
    pub const ALL: [Self; 4] = [Self::X64, Self::X86, Self::Arm64, Self::Arm32];

    /// Every raw string recognised for an architecture.
    #[must_use]
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::X64 => &["x64", "x86_64", "amd64", "x86-64"],
            Self::X86 => &["x86", "i386", "i486", "i586", "i686", "ia32"],
            Self::Arm64 => &["arm64", "aarch64", "armv8", "armv8l", "arm64e"],
            Self::Arm32 => &["arm32", "arm", "armv7", "armv7l", "armv6l", "armhf"],
        }
    }

    /// Parse from string, accepting common aliases.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let lowered = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|arch| arch.aliases().contains(&lowered.as_str()))
    }

    /// Canonical name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.aliases()[0]
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform identifier combining OS and architecture.
///
/// Rendered and parsed as `<os>-<arch>`, e.g. `linux-x64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PlatformKey {
    pub os: Os,
    pub arch: Arch,
}

impl PlatformKey {
    /// Create a new platform.
    #[must_use]
    pub const fn new(os: Os, arch: Arch) -> Self {
        Self { os, arch }
    }

    /// Parse from string like `macos-arm64` or `darwin-aarch64`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let (os, arch) = s.trim().split_once('-')?;
        Some(Self {
            os: Os::parse(os)?,
            arch: Arch::parse(arch)?,
        })
    }

    /// Every member of the enumeration.
    pub fn all() -> impl Iterator<Item = Self> {
        Os::ALL
            .into_iter()
            .flat_map(|os| Arch::ALL.into_iter().map(move |arch| Self::new(os, arch)))
    }

    /// Capabilities of this platform's filesystem and executables.
    #[must_use]
    pub fn capabilities(&self) -> &'static dyn PlatformCapabilities {
        capabilities(self.os)
    }
}

impl fmt::Display for PlatformKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

impl TryFrom<String> for PlatformKey {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid platform '{value}'"))
    }
}

impl From<PlatformKey> for String {
    fn from(value: PlatformKey) -> Self {
        value.to_string()
    }
}

/// Detects the host platform.
///
/// A detector can be pinned to a fixed platform, which the runner uses when a
/// caller provisions tools for a platform other than the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlatformDetector {
    fixed: Option<PlatformKey>,
}

impl PlatformDetector {
    /// Detector for the running host.
    #[must_use]
    pub const fn new() -> Self {
        Self { fixed: None }
    }

    /// Detector that always reports `platform`.
    #[must_use]
    pub const fn fixed(platform: PlatformKey) -> Self {
        Self {
            fixed: Some(platform),
        }
    }

    /// Detect the platform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedPlatform`] if the host OS or architecture
    /// is outside the enumeration.
    pub fn detect(&self) -> Result<PlatformKey> {
        match self.fixed {
            Some(platform) => Ok(platform),
            None => Self::from_raw(std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    /// Map raw OS and architecture identifiers to a platform.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedPlatform`] if either axis is unknown.
    pub fn from_raw(os: &str, arch: &str) -> Result<PlatformKey> {
        match (Os::parse(os), Arch::parse(arch)) {
            (Some(os), Some(arch)) => Ok(PlatformKey::new(os, arch)),
            _ => Err(Error::UnsupportedPlatform {
                platform: format!("{os}-{arch}"),
                tool: None,
                version: None,
            }),
        }
    }
}

/// How a platform separates path components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStyle {
    /// `/` separated.
    Posix,
    /// `\` separated, with drive letters.
    Windows,
}

impl PathStyle {
    /// The separator character.
    #[must_use]
    pub const fn separator(self) -> char {
        match self {
            Self::Posix => '/',
            Self::Windows => '\\',
        }
    }
}

/// Per-platform filesystem behavior needed by the installer.
pub trait PlatformCapabilities: Send + Sync {
    /// Ensure `path` can be executed.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if permissions cannot be changed.
    fn make_executable(&self, path: &Path) -> std::io::Result<()>;

    /// Path separator style.
    fn path_style(&self) -> PathStyle;

    /// File name of a tool's executable on this platform.
    fn executable_name(&self, tool: &str) -> String;
}

struct PosixCapabilities;

impl PlatformCapabilities for PosixCapabilities {
    fn make_executable(&self, path: &Path) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(perms.mode() | 0o755);
            std::fs::set_permissions(path, perms)?;
        }
        #[cfg(not(unix))]
        let _ = path;
        Ok(())
    }

    fn path_style(&self) -> PathStyle {
        PathStyle::Posix
    }

    fn executable_name(&self, tool: &str) -> String {
        tool.to_string()
    }
}

struct WindowsCapabilities;

impl PlatformCapabilities for WindowsCapabilities {
    fn make_executable(&self, _path: &Path) -> std::io::Result<()> {
        // Executability is decided by extension.
        Ok(())
    }

    fn path_style(&self) -> PathStyle {
        PathStyle::Windows
    }

    fn executable_name(&self, tool: &str) -> String {
        if tool.to_ascii_lowercase().ends_with(".exe") {
            tool.to_string()
        } else {
            format!("{tool}.exe")
        }
    }
}

/// Capabilities for an operating system.
#[must_use]
pub fn capabilities(os: Os) -> &'static dyn PlatformCapabilities {
    static POSIX: PosixCapabilities = PosixCapabilities;
    static WINDOWS: WindowsCapabilities = WindowsCapabilities;
    match os {
        Os::Windows => &WINDOWS,
        Os::Macos | Os::Linux => &POSIX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_parse() {
        let p = PlatformKey::parse("macos-arm64").unwrap();
        assert_eq!(p, PlatformKey::new(Os::Macos, Arch::Arm64));

        let p = PlatformKey::parse("darwin-aarch64").unwrap();
        assert_eq!(p, PlatformKey::new(Os::Macos, Arch::Arm64));

        let p = PlatformKey::parse("linux-x86_64").unwrap();
        assert_eq!(p, PlatformKey::new(Os::Linux, Arch::X64));

        assert!(PlatformKey::parse("invalid").is_none());
        assert!(PlatformKey::parse("freebsd-x64").is_none());
        assert!(PlatformKey::parse("linux-mips").is_none());
        assert!(PlatformKey::parse("").is_none());
    }

    #[test]
    fn test_platform_display_round_trips_through_parse() {
        for platform in PlatformKey::all() {
            assert_eq!(PlatformKey::parse(&platform.to_string()), Some(platform));
        }
        assert_eq!(PlatformKey::all().count(), 12);
    }

    #[test]
    fn test_os_parse_aliases() {
        assert_eq!(Os::parse("darwin"), Some(Os::Macos));
        assert_eq!(Os::parse("MacOS"), Some(Os::Macos));
        assert_eq!(Os::parse("osx"), Some(Os::Macos));
        assert_eq!(Os::parse("Win32"), Some(Os::Windows));
        assert_eq!(Os::parse("LINUX"), Some(Os::Linux));
        assert_eq!(Os::parse("freebsd"), None);
    }

    #[test]
    fn test_arch_parse_aliases() {
        assert_eq!(Arch::parse("aarch64"), Some(Arch::Arm64));
        assert_eq!(Arch::parse("ARM64"), Some(Arch::Arm64));
        assert_eq!(Arch::parse("armv8l"), Some(Arch::Arm64));
        assert_eq!(Arch::parse("x86_64"), Some(Arch::X64));
        assert_eq!(Arch::parse("AMD64"), Some(Arch::X64));
        assert_eq!(Arch::parse("i686"), Some(Arch::X86));
        assert_eq!(Arch::parse("armv7l"), Some(Arch::Arm32));
        assert_eq!(Arch::parse("arm"), Some(Arch::Arm32));
        assert!(Arch::parse("riscv64").is_none());
        assert!(Arch::parse("").is_none());
    }

    #[test]
    fn test_aliases_are_unique_across_arches() {
        let mut seen = std::collections::HashSet::new();
        for arch in Arch::ALL {
            for alias in arch.aliases() {
                assert!(seen.insert(*alias), "alias {alias} maps to two arches");
            }
        }
    }

    #[test]
    fn test_detector_from_raw_rust_consts() {
        assert_eq!(
            PlatformDetector::from_raw("linux", "x86_64").unwrap(),
            PlatformKey::new(Os::Linux, Arch::X64)
        );
        assert_eq!(
            PlatformDetector::from_raw("macos", "aarch64").unwrap(),
            PlatformKey::new(Os::Macos, Arch::Arm64)
        );
        assert_eq!(
            PlatformDetector::from_raw("windows", "x86").unwrap(),
            PlatformKey::new(Os::Windows, Arch::X86)
        );
    }

    #[test]
    fn test_detector_unsupported_never_defaults() {
        let err = PlatformDetector::from_raw("freebsd", "x86_64").unwrap_err();
        assert!(matches!(err, Error::UnsupportedPlatform { tool: None, .. }));

        let err = PlatformDetector::from_raw("linux", "riscv64").unwrap_err();
        assert!(err.to_string().contains("linux-riscv64"));
    }

    #[test]
    fn test_detector_fixed() {
        let platform = PlatformKey::new(Os::Linux, Arch::Arm32);
        assert_eq!(PlatformDetector::fixed(platform).detect().unwrap(), platform);
    }

    #[test]
    fn test_serde_as_string() {
        let platform = PlatformKey::new(Os::Windows, Arch::X86);
        let json = serde_json::to_string(&platform).unwrap();
        assert_eq!(json, "\"windows-x86\"");
        let back: PlatformKey = serde_json::from_str("\"darwin-amd64\"").unwrap();
        assert_eq!(back, PlatformKey::new(Os::Macos, Arch::X64));
        assert!(serde_json::from_str::<PlatformKey>("\"plan9-x64\"").is_err());
    }

    #[test]
    fn test_executable_name() {
        assert_eq!(capabilities(Os::Windows).executable_name("zap"), "zap.exe");
        assert_eq!(capabilities(Os::Windows).executable_name("zap.exe"), "zap.exe");
        assert_eq!(capabilities(Os::Linux).executable_name("zap"), "zap");
        assert_eq!(capabilities(Os::Windows).path_style().separator(), '\\');
        assert_eq!(capabilities(Os::Macos).path_style(), PathStyle::Posix);
    }

    #[cfg(unix)]
    #[test]
    fn test_make_executable_sets_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        capabilities(Os::Linux).make_executable(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
