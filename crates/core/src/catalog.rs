//! Static artifact catalog.
//!
//! The catalog maps `(tool, version, platform)` to an [`ArtifactDescriptor`].
//! It is a versioned table shipped with the release (see `catalog.toml`), never
//! a live index: resolution is pure and performs no I/O.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::layout::validate_component;
use crate::platform::PlatformKey;
use crate::{Error, Result};

const BUILTIN_CATALOG: &str = include_str!("../catalog.toml");

/// Archive format of a downloaded artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArchiveKind {
    /// `.zip` archive.
    #[serde(rename = "zip")]
    Zip,
    /// Gzip-compressed tarball.
    #[serde(rename = "tar.gz", alias = "tgz")]
    TarGz,
    /// The download is the executable itself.
    #[serde(rename = "raw-binary", alias = "raw")]
    RawBinary,
}

impl ArchiveKind {
    /// Guess the archive kind from a URL's file name.
    #[must_use]
    pub fn infer(url: &str) -> Self {
        let name = url_file_name(url).to_ascii_lowercase();
        if name.ends_with(".zip") {
            Self::Zip
        } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Self::TarGz
        } else {
            Self::RawBinary
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
            Self::RawBinary => "raw-binary",
        })
    }
}

fn url_file_name(url: &str) -> &str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/').next().unwrap_or(path)
}

/// Everything needed to fetch and unpack one tool build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Tool name.
    pub tool: String,
    /// Concrete version.
    pub version: String,
    /// Platform the build targets.
    pub platform: PlatformKey,
    /// Download location (`https://` or `file://`).
    pub url: String,
    /// Expected SHA-256 (lowercase hex). `None` when the publisher pins no digest.
    pub checksum: Option<String>,
    /// How the download is packaged.
    pub archive_kind: ArchiveKind,
    /// Path of the executable inside the archive, `/` separated.
    pub entry_path: String,
}

impl ArtifactDescriptor {
    /// File name component of the download URL.
    #[must_use]
    pub fn file_name(&self) -> &str {
        url_file_name(&self.url)
    }

    /// File name of the installed executable (last component of `entry_path`).
    #[must_use]
    pub fn executable_name(&self) -> &str {
        self.entry_path
            .rsplit('/')
            .next()
            .unwrap_or(&self.entry_path)
    }
}

/// Which version of a tool to resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum VersionSpec {
    /// The newest version known to the catalog.
    #[default]
    Latest,
    /// A literal version string.
    Exact(String),
}

impl VersionSpec {
    /// Exact version spec.
    #[must_use]
    pub fn exact(version: impl Into<String>) -> Self {
        Self::Exact(version.into())
    }
}

impl FromStr for VersionSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("latest") {
            Ok(Self::Latest)
        } else {
            Ok(Self::Exact(s.to_string()))
        }
    }
}

impl From<Option<&str>> for VersionSpec {
    fn from(value: Option<&str>) -> Self {
        value.map_or(Self::Latest, |v| v.parse().unwrap_or_default())
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => f.write_str("latest"),
            Self::Exact(v) => f.write_str(v),
        }
    }
}

// On-disk shape of the catalog table.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    tools: BTreeMap<String, ToolTable>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolTable {
    latest: Option<String>,
    executable: Option<String>,
    #[serde(default)]
    versions: BTreeMap<String, BTreeMap<String, ArtifactTable>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArtifactTable {
    url: String,
    sha256: Option<String>,
    archive: Option<ArchiveKind>,
    entry: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct ToolEntry {
    latest: Option<String>,
    versions: BTreeMap<String, BTreeMap<PlatformKey, ArtifactDescriptor>>,
}

/// Static table of downloadable tool builds.
#[derive(Debug, Clone, Default)]
pub struct ArtifactCatalog {
    tools: BTreeMap<String, ToolEntry>,
}

impl ArtifactCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The catalog shipped with this release.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the embedded table is malformed.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    /// Load a catalog table from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read, or a configuration
    /// error if it is malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Error::io(e, path, "read catalog"))?;
        Self::from_toml_str(&content).map_err(|e| match e {
            Error::Configuration(msg) => {
                Error::configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse a catalog table from TOML.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for syntax errors, unknown platforms,
    /// invalid names, empty URLs or unsafe entry paths, and
    /// [`Error::UnknownVersion`] when `latest` names a missing version.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)
            .map_err(|e| Error::configuration(format!("Invalid catalog: {e}")))?;

        let mut catalog = Self::new();
        for (tool, table) in file.tools {
            validate_component("tool", &tool)?;
            let executable = table.executable.as_deref().unwrap_or(&tool).to_string();

            for (version, platforms) in table.versions {
                validate_component("version", &version)?;
                for (key, artifact) in platforms {
                    let platform = PlatformKey::parse(&key).ok_or_else(|| {
                        Error::configuration(format!(
                            "Unknown platform '{key}' for {tool} {version}"
                        ))
                    })?;
                    let entry_path = artifact.entry.unwrap_or_else(|| {
                        platform.capabilities().executable_name(&executable)
                    });
                    catalog.insert(ArtifactDescriptor {
                        tool: tool.clone(),
                        version: version.clone(),
                        platform,
                        archive_kind: artifact
                            .archive
                            .unwrap_or_else(|| ArchiveKind::infer(&artifact.url)),
                        url: artifact.url,
                        checksum: artifact.sha256.as_deref().map(crate::normalize_checksum),
                        entry_path,
                    })?;
                }
            }

            if let Some(latest) = table.latest {
                catalog.set_latest(&tool, &latest)?;
            }
        }
        Ok(catalog)
    }

    /// Add a descriptor, replacing any existing one for the same triple.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for invalid names, an empty URL, or an
    /// entry path that is absolute or escapes the install slot.
    pub fn insert(&mut self, descriptor: ArtifactDescriptor) -> Result<()> {
        validate_component("tool", &descriptor.tool)?;
        validate_component("version", &descriptor.version)?;
        if descriptor.url.trim().is_empty() {
            return Err(Error::configuration(format!(
                "Empty URL for {} {} ({})",
                descriptor.tool, descriptor.version, descriptor.platform
            )));
        }
        validate_entry_path(&descriptor)?;

        self.tools
            .entry(descriptor.tool.clone())
            .or_default()
            .versions
            .entry(descriptor.version.clone())
            .or_default()
            .insert(descriptor.platform, descriptor);
        Ok(())
    }

    /// Pin the version `Latest` resolves to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTool`] or [`Error::UnknownVersion`] if the
    /// table has no such entry.
    pub fn set_latest(&mut self, tool: &str, version: &str) -> Result<()> {
        let available = self.versions(tool)?;
        let entry = self.entry(tool)?;
        if !entry.versions.contains_key(version) {
            return Err(Error::UnknownVersion {
                tool: tool.to_string(),
                version: version.to_string(),
                available,
            });
        }
        if let Some(entry) = self.tools.get_mut(tool) {
            entry.latest = Some(version.to_string());
        }
        Ok(())
    }

    /// Catalogued tool names in sorted order.
    pub fn tools(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    /// Whether `tool` is catalogued.
    #[must_use]
    pub fn contains(&self, tool: &str) -> bool {
        self.tools.contains_key(tool)
    }

    /// Versions of `tool`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTool`] if the tool is not catalogued.
    pub fn versions(&self, tool: &str) -> Result<Vec<String>> {
        let mut versions: Vec<String> = self.entry(tool)?.versions.keys().cloned().collect();
        versions.sort_by(|a, b| compare_versions(b, a));
        Ok(versions)
    }

    /// Platforms that have a build of `tool` at `version`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTool`] or [`Error::UnknownVersion`].
    pub fn platforms(&self, tool: &str, version: &str) -> Result<Vec<PlatformKey>> {
        Ok(self.version_table(tool, version)?.keys().copied().collect())
    }

    /// Turn a version spec into a concrete catalogued version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTool`], or [`Error::UnknownVersion`] if an
    /// exact version is not catalogued or the tool has no versions at all.
    pub fn resolve_version(&self, tool: &str, spec: &VersionSpec) -> Result<String> {
        let entry = self.entry(tool)?;
        match spec {
            VersionSpec::Exact(version) => {
                if entry.versions.contains_key(version) {
                    Ok(version.clone())
                } else {
                    Err(Error::UnknownVersion {
                        tool: tool.to_string(),
                        version: version.clone(),
                        available: self.versions(tool)?,
                    })
                }
            }
            VersionSpec::Latest => entry
                .latest
                .clone()
                .or_else(|| {
                    entry
                        .versions
                        .keys()
                        .max_by(|a, b| compare_versions(a, b))
                        .cloned()
                })
                .ok_or_else(|| Error::UnknownVersion {
                    tool: tool.to_string(),
                    version: VersionSpec::Latest.to_string(),
                    available: Vec::new(),
                }),
        }
    }

    /// Resolve `(tool, spec, platform)` to a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTool`], [`Error::UnknownVersion`], or
    /// [`Error::UnsupportedPlatform`] when the version has no build for
    /// `platform`.
    pub fn resolve(
        &self,
        tool: &str,
        spec: &VersionSpec,
        platform: PlatformKey,
    ) -> Result<ArtifactDescriptor> {
        let version = self.resolve_version(tool, spec)?;
        self.version_table(tool, &version)?
            .get(&platform)
            .cloned()
            .ok_or_else(|| Error::UnsupportedPlatform {
                platform: platform.to_string(),
                tool: Some(tool.to_string()),
                version: Some(version),
            })
    }

    fn entry(&self, tool: &str) -> Result<&ToolEntry> {
        self.tools.get(tool).ok_or_else(|| Error::UnknownTool {
            tool: tool.to_string(),
            known: self.tools.keys().cloned().collect(),
        })
    }

    fn version_table(
        &self,
        tool: &str,
        version: &str,
    ) -> Result<&BTreeMap<PlatformKey, ArtifactDescriptor>> {
        let entry = self.entry(tool)?;
        match entry.versions.get(version) {
            Some(table) => Ok(table),
            None => Err(Error::UnknownVersion {
                tool: tool.to_string(),
                version: version.to_string(),
                available: self.versions(tool)?,
            }),
        }
    }
}

fn validate_entry_path(descriptor: &ArtifactDescriptor) -> Result<()> {
    let entry = &descriptor.entry_path;
    let escapes = entry.is_empty()
        || entry.starts_with('/')
        || entry.starts_with('\\')
        || entry.contains(':')
        || entry.split(['/', '\\']).any(|c| c == "..");
    if escapes {
        return Err(Error::configuration(format!(
            "Invalid entry path '{entry}' for {} {} ({})",
            descriptor.tool, descriptor.version, descriptor.platform
        )));
    }
    Ok(())
}

/// Order two version strings.
///
/// Segments split on `.`, `-`, `_` and `+` compare numerically when both are
/// numbers and lexically otherwise. When one version is a prefix of the
/// other, a trailing numeric segment makes it newer (`1.2.1 > 1.2`) and a
/// trailing tag makes it older (`1.2-rc1 < 1.2`).
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn segments(v: &str) -> Vec<&str> {
        let v = v.strip_prefix(['v', 'V']).unwrap_or(v);
        v.split(['.', '-', '_', '+']).filter(|s| !s.is_empty()).collect()
    }

    let (sa, sb) = (segments(a), segments(b));
    for (x, y) in sa.iter().zip(&sb) {
        let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
            (Ok(nx), Ok(ny)) => nx.cmp(&ny),
            (Ok(_), Err(_)) => Ordering::Greater,
            (Err(_), Ok(_)) => Ordering::Less,
            (Err(_), Err(_)) => x.cmp(y),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    let tail_is_release = |extra: &str| extra.parse::<u64>().is_ok();
    match sa.len().cmp(&sb.len()) {
        Ordering::Equal => a.cmp(b),
        Ordering::Greater if tail_is_release(sa[sb.len()]) => Ordering::Greater,
        Ordering::Greater => Ordering::Less,
        Ordering::Less if tail_is_release(sb[sa.len()]) => Ordering::Less,
        Ordering::Less => Ordering::Greater,
    }
}
