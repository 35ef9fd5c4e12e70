//! Artifact downloader.
//!
//! Streams a descriptor's URL into `<root>/.scratch/`, never into an install
//! slot. The partial file is a [`TempPath`] and is removed on every exit path
//! that does not hand it to the caller: failed attempts, integrity
//! mismatches, cancellation, and panics.

use indicatif::{ProgressBar, ProgressStyle};
use simplicity_core::{ArtifactDescriptor, Error, Result, Stage, ToolsLayout};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{Transport, TransportError};

/// Bounded exponential backoff for transient network failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// A fully downloaded artifact in the scratch area.
///
/// Dropping it deletes the file.
#[derive(Debug)]
pub struct DownloadedArtifact {
    path: TempPath,
    /// SHA-256 of the downloaded bytes.
    pub sha256: String,
    /// Size in bytes.
    pub size: u64,
    /// Whether `sha256` was checked against a catalogued digest.
    pub checksum_verified: bool,
}

impl DownloadedArtifact {
    /// Location of the downloaded file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fetches artifacts with retry, verification and cancellation.
#[derive(Clone)]
pub struct Downloader {
    layout: ToolsLayout,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    show_progress: bool,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("layout", &self.layout)
            .field("retry", &self.retry)
            .field("show_progress", &self.show_progress)
            .finish_non_exhaustive()
    }
}

impl Downloader {
    /// Downloader writing into `layout`'s scratch area.
    #[must_use]
    pub fn new(layout: ToolsLayout, transport: Arc<dyn Transport>) -> Self {
        Self {
            layout,
            transport,
            retry: RetryPolicy::default(),
            show_progress: false,
        }
    }

    /// Replace the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Show a progress bar on stderr while downloading.
    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Download and verify `descriptor`.
    ///
    /// # Errors
    ///
    /// - [`Error::Download`] after the retry budget is spent or on a fatal
    ///   transport error
    /// - [`Error::Integrity`] if a catalogued checksum does not match; this is
    ///   never retried
    /// - [`Error::Cancelled`] if `cancel` fires
    pub async fn fetch(
        &self,
        descriptor: &ArtifactDescriptor,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArtifact> {
        self.layout.ensure_dirs()?;
        let attempts = self.retry.attempts();
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                tool = %descriptor.tool,
                version = %descriptor.version,
                url = %descriptor.url,
                attempt,
                "Downloading artifact"
            );

            match self.attempt(descriptor, cancel).await? {
                Ok((path, size)) => return self.verify(descriptor, path, size).await,
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        tool = %descriptor.tool,
                        url = %descriptor.url,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Download failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Err(cancelled(descriptor)),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    return Err(Error::Download {
                        tool: descriptor.tool.clone(),
                        version: descriptor.version.clone(),
                        platform: descriptor.platform.to_string(),
                        url: descriptor.url.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        }
    }

    /// One attempt into a fresh temp file.
    ///
    /// The outer `Result` carries errors that end the download outright.
    async fn attempt(
        &self,
        descriptor: &ArtifactDescriptor,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<(TempPath, u64), TransportError>> {
        let scratch = self.layout.scratch_dir();
        let temp = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", descriptor.tool, descriptor.version))
            .suffix(".part")
            .tempfile_in(&scratch)
            .map_err(|e| Error::io(e, &scratch, "create download file"))?;
        let (file, path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let progress = self.progress_bar(descriptor);
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                progress.abandon();
                // `path` drops here and removes the partial file.
                return Err(cancelled(descriptor));
            }
            outcome = self.transport.fetch(&descriptor.url, &mut file, &progress) => outcome,
        };
        progress.finish_and_clear();

        let size = match outcome {
            Ok(size) => size,
            Err(e) => return Ok(Err(e)),
        };
        if let Err(e) = file.sync_all().await {
            return Ok(Err(TransportError::Fatal(format!(
                "Failed to sync download: {e}"
            ))));
        }
        drop(file);
        Ok(Ok((path, size)))
    }

    async fn verify(
        &self,
        descriptor: &ArtifactDescriptor,
        path: TempPath,
        size: u64,
    ) -> Result<DownloadedArtifact> {
        let hash_path = path.to_path_buf();
        let sha256 = tokio::task::spawn_blocking(move || simplicity_core::sha256_file(&hash_path))
            .await
            .map_err(|e| Error::io(std::io::Error::other(e), &*path, "hash"))?
            .map_err(|e| Error::io(e, &*path, "hash"))?;

        let checksum_verified = match descriptor.checksum.as_deref() {
            Some(expected) => {
                let expected = simplicity_core::normalize_checksum(expected);
                if expected != sha256 {
                    warn!(
                        tool = %descriptor.tool,
                        version = %descriptor.version,
                        url = %descriptor.url,
                        %expected,
                        actual = %sha256,
                        "Checksum mismatch, discarding artifact"
                    );
                    // `path` drops here and removes the file.
                    return Err(Error::Integrity {
                        tool: descriptor.tool.clone(),
                        version: descriptor.version.clone(),
                        platform: descriptor.platform.to_string(),
                        url: descriptor.url.clone(),
                        expected,
                        actual: sha256,
                    });
                }
                true
            }
            None => {
                debug!(tool = %descriptor.tool, version = %descriptor.version, %sha256, "No catalogued checksum, recording computed digest");
                false
            }
        };

        info!(
            tool = %descriptor.tool,
            version = %descriptor.version,
            platform = %descriptor.platform,
            size,
            verified = checksum_verified,
            "Downloaded artifact"
        );
        Ok(DownloadedArtifact {
            path,
            sha256,
            size,
            checksum_verified,
        })
    }

    fn progress_bar(&self, descriptor: &ArtifactDescriptor) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template(
            "{msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})",
        ) {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(format!("{} {}", descriptor.tool, descriptor.version));
        bar
    }
}

fn cancelled(descriptor: &ArtifactDescriptor) -> Error {
    Error::Cancelled {
        tool: descriptor.tool.clone(),
        version: Some(descriptor.version.clone()),
        stage: Stage::Download,
        reason: "download aborted".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use simplicity_core::{ArchiveKind, Arch, Os, PlatformKey};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::fs::File;
    use tokio::io::AsyncWriteExt;

    /// Serves `body`, failing the first `failures` attempts.
    struct FlakyTransport {
        body: Vec<u8>,
        failures: u32,
        fatal: bool,
        calls: AtomicU32,
    }

    impl FlakyTransport {
        fn new(body: &[u8], failures: u32) -> Self {
            Self {
                body: body.to_vec(),
                failures,
                fatal: false,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn fetch(
            &self,
            _url: &str,
            sink: &mut File,
            _progress: &ProgressBar,
        ) -> std::result::Result<u64, TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                sink.write_all(b"partial").await.unwrap();
                return Err(if self.fatal {
                    TransportError::Fatal("gone".into())
                } else {
                    TransportError::Transient("connection reset".into())
                });
            }
            sink.write_all(&self.body).await.unwrap();
            Ok(self.body.len() as u64)
        }
    }

    struct HangingTransport;

    #[async_trait]
    impl Transport for HangingTransport {
        async fn fetch(
            &self,
            _url: &str,
            sink: &mut File,
            _progress: &ProgressBar,
        ) -> std::result::Result<u64, TransportError> {
            sink.write_all(b"partial").await.unwrap();
            std::future::pending().await
        }
    }

    fn descriptor(checksum: Option<String>) -> ArtifactDescriptor {
        ArtifactDescriptor {
            tool: "zap".into(),
            version: "1.0.0".into(),
            platform: PlatformKey::new(Os::Linux, Arch::X64),
            url: "https://example.invalid/zap".into(),
            checksum,
            archive_kind: ArchiveKind::RawBinary,
            entry_path: "zap".into(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn scratch_files(layout: &ToolsLayout) -> usize {
        std::fs::read_dir(layout.scratch_dir())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    #[test]
    fn test_retry_delays_double_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_secs(1));
        assert_eq!(policy.delay_after(3), Duration::from_secs(2));
        assert_eq!(policy.delay_after(10), Duration::from_secs(8));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_verified_download() {
        let temp = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(temp.path());
        let transport = Arc::new(FlakyTransport::new(b"binary", 0));
        let downloader = Downloader::new(layout.clone(), transport);

        let d = descriptor(Some(format!("sha256:{}", simplicity_core::sha256_hex(b"binary"))));
        let artifact = downloader.fetch(&d, &CancellationToken::new()).await.unwrap();

        assert!(artifact.checksum_verified);
        assert_eq!(artifact.size, 6);
        assert!(artifact.path().starts_with(layout.scratch_dir()));
        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"binary");

        let path = artifact.path().to_path_buf();
        drop(artifact);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_checksum_records_digest() {
        let temp = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(temp.path());
        let downloader = Downloader::new(layout, Arc::new(FlakyTransport::new(b"binary", 0)));

        let artifact = downloader
            .fetch(&descriptor(None), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!artifact.checksum_verified);
        assert_eq!(artifact.sha256, simplicity_core::sha256_hex(b"binary"));
    }

    #[tokio::test]
    async fn test_integrity_mismatch_discards_file_and_is_not_retried() {
        let temp = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(temp.path());
        let transport = Arc::new(FlakyTransport::new(b"binary", 0));
        let downloader =
            Downloader::new(layout.clone(), transport.clone()).with_retry(fast_retry());

        let err = downloader
            .fetch(&descriptor(Some("00".repeat(32))), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Integrity { .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scratch_files(&layout), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let temp = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(temp.path());
        let transport = Arc::new(FlakyTransport::new(b"binary", 2));
        let downloader =
            Downloader::new(layout.clone(), transport.clone()).with_retry(fast_retry());

        let artifact = downloader
            .fetch(&descriptor(None), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read(artifact.path()).unwrap(), b"binary");
        drop(artifact);
        assert_eq!(scratch_files(&layout), 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let temp = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(temp.path());
        let transport = Arc::new(FlakyTransport::new(b"binary", 10));
        let downloader =
            Downloader::new(layout.clone(), transport.clone()).with_retry(fast_retry());

        let err = downloader
            .fetch(&descriptor(None), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            Error::Download {
                attempts, message, ..
            } => {
                assert_eq!(attempts, 3);
                assert_eq!(message, "connection reset");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
        assert_eq!(scratch_files(&layout), 0);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let temp = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(temp.path());
        let mut flaky = FlakyTransport::new(b"binary", 1);
        flaky.fatal = true;
        let transport = Arc::new(flaky);
        let downloader = Downloader::new(layout, transport.clone()).with_retry(fast_retry());

        let err = downloader
            .fetch(&descriptor(None), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Download { attempts: 1, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_and_cleans_up() {
        let temp = tempfile::tempdir().unwrap();
        let layout = ToolsLayout::new(temp.path());
        let downloader = Downloader::new(layout.clone(), Arc::new(HangingTransport));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = downloader.fetch(&descriptor(None), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.stage(), Stage::Download);
        assert_eq!(scratch_files(&layout), 0);
    }
}
