//! Shared fixtures: a counting in-memory transport and archive builders.

#![allow(dead_code)]

use async_trait::async_trait;
use indicatif::ProgressBar;
use simplicity_core::{ArtifactCatalog, PlatformKey, sha256_hex};
use simplicity_install::{RetryPolicy, Transport, TransportError};
use simplicity_tools::ToolRunner;
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

/// Serves artifacts from memory and counts every fetch.
#[derive(Default)]
pub struct CountingTransport {
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
    fetches: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.artifacts.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for CountingTransport {
    async fn fetch(
        &self,
        url: &str,
        sink: &mut File,
        _progress: &ProgressBar,
    ) -> Result<u64, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let body = self
            .artifacts
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| TransportError::Fatal(format!("404 {url}")))?;
        sink.write_all(&body)
            .await
            .map_err(|e| TransportError::Fatal(e.to_string()))?;
        Ok(body.len() as u64)
    }
}

/// Zip archive holding `entries`; files are marked 0644 so the installer
/// must set the executable bit itself.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().unix_permissions(0o644);
    for (name, body) in entries {
        zip.start_file(*name, options).unwrap();
        zip.write_all(body).unwrap();
    }
    zip.finish().unwrap().into_inner()
}

/// Shell script body printing its name and arguments, then exiting with `code`.
pub fn echo_script(name: &str, code: i32) -> Vec<u8> {
    format!("#!/bin/sh\necho \"{name} $*\"\nexit {code}\n").into_bytes()
}

pub const SLC_URL: &str = "https://mirror.invalid/slc_cli_linux.zip";
pub const ZAP_URL: &str = "https://mirror.invalid/zap-linux-x64.zip";

/// Archive for slc-cli 4.2.0 nesting the executable under `slc_cli/`.
pub fn slc_archive(script: &[u8]) -> Vec<u8> {
    zip_bytes(&[("slc_cli/slc-cli", script), ("slc_cli/bin/slc.jar", b"jar")])
}

/// Catalog with slc-cli 4.2.0 and zap 1.0.0 for linux-x64 only.
///
/// `slc_sha` is written as the slc-cli checksum when given.
pub fn catalog_toml(slc_sha: Option<&str>) -> String {
    let sha_line = slc_sha.map(|s| format!("sha256 = \"{s}\"\n")).unwrap_or_default();
    format!(
        r#"
[tools.slc-cli]
latest = "4.2.0"

[tools.slc-cli.versions."4.2.0".linux-x64]
url = "{SLC_URL}"
{sha_line}
[tools.zap]
executable = "zap-cli"

[tools.zap.versions."1.0.0".linux-x64]
url = "{ZAP_URL}"
"#
    )
}

pub fn linux_x64() -> PlatformKey {
    PlatformKey::parse("linux-x64").unwrap()
}

/// Runner over `root` whose slc-cli artifact is `archive`, checksum pinned.
pub fn runner_with(
    root: &Path,
    transport: Arc<CountingTransport>,
    archive: &[u8],
    platform: PlatformKey,
) -> ToolRunner {
    transport.serve(SLC_URL, archive.to_vec());
    let catalog =
        ArtifactCatalog::from_toml_str(&catalog_toml(Some(&sha256_hex(archive)))).unwrap();
    ToolRunner::builder(root)
        .catalog(catalog)
        .platform(platform)
        .transport(transport)
        .retry_policy(RetryPolicy::no_retry())
        .lock_timeout(Duration::from_secs(30))
        .build()
        .unwrap()
}
