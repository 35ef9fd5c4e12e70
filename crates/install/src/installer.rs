//! Installs a verified artifact into its versioned slot.
//!
//! Everything happens inside a private staging directory under
//! `<root>/.scratch/`. The only step visible to other readers is the final
//! rename of the staged tree to `<root>/<tool>/<version>`, so a slot is either
//! absent or complete. Callers must hold the slot's [`SlotLock`].
//!
//! [`SlotLock`]: simplicity_core::SlotLock

use chrono::Utc;
use simplicity_core::{ArtifactDescriptor, Error, InstalledTool, Result, ToolsLayout};
use std::path::Path;
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::download::DownloadedArtifact;
use crate::extract::{extract, locate_entry};

/// Name of the staged slot inside a staging directory.
const STAGED_SLOT: &str = "slot";
/// Where a replaced slot is parked until the staging directory is dropped.
const REPLACED_SLOT: &str = "replaced";

/// Extracts artifacts into the managed root.
#[derive(Debug, Clone)]
pub struct Installer {
    layout: ToolsLayout,
}

impl Installer {
    /// Installer targeting `layout`.
    #[must_use]
    pub fn new(layout: ToolsLayout) -> Self {
        Self { layout }
    }

    /// Extract `artifact` and move it into `<root>/<tool>/<version>`.
    ///
    /// Returns the record for the caller to persist. On failure the staging
    /// directory is removed and the final slot is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Install`] if extraction, entry lookup, permission
    /// changes or the final rename fail.
    pub fn install(
        &self,
        descriptor: &ArtifactDescriptor,
        artifact: &DownloadedArtifact,
    ) -> Result<InstalledTool> {
        let fail = |message: String| Error::Install {
            tool: descriptor.tool.clone(),
            version: descriptor.version.clone(),
            platform: descriptor.platform.to_string(),
            message,
        };

        self.layout.ensure_dirs()?;
        let staging = self.staging_dir(descriptor).map_err(|e| {
            fail(format!("Failed to create staging directory: {e}"))
        })?;
        let staged_slot = staging.path().join(STAGED_SLOT);

        extract(
            artifact.path(),
            descriptor.archive_kind,
            &staged_slot,
            &descriptor.entry_path,
        )
        .map_err(|e| fail(format!("Failed to extract {}: {e}", descriptor.file_name())))?;

        let staged_exe = locate_entry(&staged_slot, &descriptor.entry_path)
            .map_err(|e| fail(e.to_string()))?;
        descriptor
            .platform
            .capabilities()
            .make_executable(&staged_exe)
            .map_err(|e| fail(format!("Failed to mark executable: {e}")))?;

        let relative = staged_exe
            .strip_prefix(&staged_slot)
            .map_err(|e| fail(e.to_string()))?
            .to_path_buf();
        let executable_size = std::fs::metadata(&staged_exe)
            .map_err(|e| fail(format!("Failed to stat executable: {e}")))?
            .len();
        let executable_sha256 = simplicity_core::sha256_file(&staged_exe)
            .map_err(|e| fail(format!("Failed to hash executable: {e}")))?;

        let slot = self.layout.slot_dir(&descriptor.tool, &descriptor.version);
        self.publish(&staging, &staged_slot, &slot)
            .map_err(|e| fail(format!("Failed to move into {}: {e}", slot.display())))?;
        drop(staging);

        let executable_path = slot.join(relative);
        info!(
            tool = %descriptor.tool,
            version = %descriptor.version,
            platform = %descriptor.platform,
            path = %executable_path.display(),
            "Installed tool"
        );

        Ok(InstalledTool {
            tool: descriptor.tool.clone(),
            version: descriptor.version.clone(),
            executable_path,
            installed_at: Utc::now(),
            checksum_verified: artifact.checksum_verified,
            platform: Some(descriptor.platform),
            source_url: Some(descriptor.url.clone()),
            artifact_sha256: Some(artifact.sha256.clone()),
            executable_size: Some(executable_size),
            executable_sha256: Some(executable_sha256),
        })
    }

    fn staging_dir(&self, descriptor: &ArtifactDescriptor) -> std::io::Result<TempDir> {
        tempfile::Builder::new()
            .prefix(&format!("staging-{}-{}-", descriptor.tool, descriptor.version))
            .tempdir_in(self.layout.scratch_dir())
    }

    /// Rename the staged tree into place, parking any previous slot inside
    /// the staging directory so it is deleted with it.
    ///
    /// If the staged tree cannot be moved in, the parked slot is moved back.
    fn publish(&self, staging: &TempDir, staged_slot: &Path, slot: &Path) -> std::io::Result<()> {
        if let Some(parent) = slot.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let parked = staging.path().join(REPLACED_SLOT);
        let replacing = slot.exists();
        if replacing {
            debug!(slot = %slot.display(), "Replacing existing slot");
            std::fs::rename(slot, &parked)?;
        }
        std::fs::rename(staged_slot, slot).inspect_err(|e| {
            if replacing && let Err(restore) = std::fs::rename(&parked, slot) {
                warn!(slot = %slot.display(), error = %e, %restore, "Failed to restore replaced slot");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::Downloader;
    use crate::transport::FileTransport;
    use simplicity_core::{ArchiveKind, Arch, Os, PlatformKey, Stage};
    use std::io::Write;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
        for (name, body) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(body).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    async fn download(
        layout: &ToolsLayout,
        mirror: &Path,
        body: &[u8],
        kind: ArchiveKind,
        entry: &str,
    ) -> (ArtifactDescriptor, DownloadedArtifact) {
        let source = mirror.join("artifact");
        std::fs::write(&source, body).unwrap();
        let descriptor = ArtifactDescriptor {
            tool: "slc-cli".into(),
            version: "4.2.0".into(),
            platform: PlatformKey::new(Os::Linux, Arch::X64),
            url: format!("file://{}", source.display()),
            checksum: Some(simplicity_core::sha256_hex(body)),
            archive_kind: kind,
            entry_path: entry.into(),
        };
        let artifact = Downloader::new(layout.clone(), Arc::new(FileTransport))
            .fetch(&descriptor, &CancellationToken::new())
            .await
            .unwrap();
        (descriptor, artifact)
    }

    fn scratch_entries(layout: &ToolsLayout) -> Vec<String> {
        std::fs::read_dir(layout.scratch_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.ends_with(".part"))
            .collect()
    }

    #[tokio::test]
    async fn test_install_zip_into_slot() {
        let root = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(root.path());
        let body = zip_bytes(&[("slc_cli/slc-cli", b"#!/bin/sh\nexit 0\n"), ("slc_cli/lib/x.jar", b"jar")]);
        let (descriptor, artifact) =
            download(&layout, mirror.path(), &body, ArchiveKind::Zip, "slc-cli").await;

        let installed = Installer::new(layout.clone())
            .install(&descriptor, &artifact)
            .unwrap();

        let slot = layout.slot_dir("slc-cli", "4.2.0");
        assert_eq!(installed.executable_path, slot.join("slc_cli").join("slc-cli"));
        assert!(slot.join("slc_cli").join("lib").join("x.jar").is_file());
        assert!(installed.checksum_verified);
        assert_eq!(installed.artifact_sha256.as_deref(), Some(artifact.sha256.as_str()));
        assert_eq!(installed.executable_size, Some(17));
        assert!(scratch_entries(&layout).is_empty());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&installed.executable_path)
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[tokio::test]
    async fn test_install_raw_binary() {
        let root = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(root.path());
        let (descriptor, artifact) =
            download(&layout, mirror.path(), b"raw-exe", ArchiveKind::RawBinary, "slc-cli").await;

        let installed = Installer::new(layout.clone())
            .install(&descriptor, &artifact)
            .unwrap();
        assert_eq!(
            installed.executable_path,
            layout.slot_dir("slc-cli", "4.2.0").join("slc-cli")
        );
        assert_eq!(std::fs::read(&installed.executable_path).unwrap(), b"raw-exe");
    }

    #[tokio::test]
    async fn test_failed_extraction_leaves_no_slot() {
        let root = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(root.path());
        let (descriptor, artifact) =
            download(&layout, mirror.path(), b"not a zip", ArchiveKind::Zip, "slc-cli").await;

        let err = Installer::new(layout.clone())
            .install(&descriptor, &artifact)
            .unwrap_err();
        assert!(matches!(err, Error::Install { .. }));
        assert_eq!(err.stage(), Stage::Install);
        assert!(!layout.slot_dir("slc-cli", "4.2.0").exists());
        assert!(scratch_entries(&layout).is_empty());
    }

    #[tokio::test]
    async fn test_missing_entry_leaves_no_slot() {
        let root = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(root.path());
        let body = zip_bytes(&[("other-tool", b"x")]);
        let (descriptor, artifact) =
            download(&layout, mirror.path(), &body, ArchiveKind::Zip, "slc-cli").await;

        let err = Installer::new(layout.clone())
            .install(&descriptor, &artifact)
            .unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
        assert!(!layout.slot_dir("slc-cli", "4.2.0").exists());
    }

    #[tokio::test]
    async fn test_reinstall_replaces_existing_slot() {
        let root = tempfile::tempdir().unwrap();
        let mirror = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(root.path());
        let slot = layout.slot_dir("slc-cli", "4.2.0");
        std::fs::create_dir_all(&slot).unwrap();
        std::fs::write(slot.join("stale"), b"old").unwrap();

        let (descriptor, artifact) =
            download(&layout, mirror.path(), b"fresh", ArchiveKind::RawBinary, "slc-cli").await;
        Installer::new(layout.clone())
            .install(&descriptor, &artifact)
            .unwrap();

        assert!(!slot.join("stale").exists());
        assert_eq!(std::fs::read(slot.join("slc-cli")).unwrap(), b"fresh");
        assert!(scratch_entries(&layout).is_empty());
    }

    #[test]
    fn test_failed_publish_restores_existing_slot() {
        let root = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(root.path());
        layout.ensure_dirs().unwrap();
        let slot = layout.slot_dir("slc-cli", "4.2.0");
        std::fs::create_dir_all(&slot).unwrap();
        std::fs::write(slot.join("slc-cli"), b"working").unwrap();

        let staging = tempfile::tempdir_in(layout.scratch_dir()).unwrap();
        let never_extracted = staging.path().join(STAGED_SLOT);
        let installer = Installer::new(layout.clone());

        assert!(installer.publish(&staging, &never_extracted, &slot).is_err());
        assert_eq!(std::fs::read(slot.join("slc-cli")).unwrap(), b"working");
        assert!(!staging.path().join(REPLACED_SLOT).exists());
    }
}
