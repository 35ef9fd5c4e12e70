//! Byte transports for artifact URLs.
//!
//! A [`Transport`] streams one URL into a file. It makes a single attempt;
//! retry policy lives in the [`Downloader`](crate::Downloader), which uses
//! [`TransportError::is_transient`] to decide whether to try again.

use async_trait::async_trait;
use indicatif::ProgressBar;
use reqwest::Client;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, trace};

/// Failure of a single fetch attempt.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Worth retrying: timeouts, resets, non-2xx responses.
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help: malformed URL, missing local file, local write failure.
    #[error("{0}")]
    Fatal(String),
}

impl TransportError {
    /// Whether the downloader should retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Streams the content at a URL into a file.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `url` into `sink`, advancing `progress` as bytes arrive.
    ///
    /// Returns the number of bytes written.
    async fn fetch(
        &self,
        url: &str,
        sink: &mut File,
        progress: &ProgressBar,
    ) -> Result<u64, TransportError>;
}

/// HTTP(S) transport backed by `reqwest` with rustls.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    stall_timeout: Duration,
}

impl HttpTransport {
    /// How long a response may go without delivering a chunk.
    pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(60);

    /// Create a transport with a fresh client.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the TLS backend fails to initialize.
    pub fn new() -> simplicity_core::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("simplicity-tools/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                simplicity_core::Error::configuration(format!("Failed to create HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            stall_timeout: Self::DEFAULT_STALL_TIMEOUT,
        })
    }

    /// Override the per-chunk stall timeout.
    #[must_use]
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }
}

fn classify(e: &reqwest::Error) -> TransportError {
    if e.is_builder() {
        TransportError::Fatal(format!("Invalid request: {e}"))
    } else {
        TransportError::Transient(e.to_string())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        sink: &mut File,
        progress: &ProgressBar,
    ) -> Result<u64, TransportError> {
        debug!(%url, "HTTP GET");
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Transient(format!("HTTP {status}")));
        }
        if let Some(len) = response.content_length() {
            progress.set_length(len);
        }

        let mut written = 0u64;
        loop {
            let chunk = tokio::time::timeout(self.stall_timeout, response.chunk())
                .await
                .map_err(|_| {
                    TransportError::Transient(format!(
                        "No data received for {}s",
                        self.stall_timeout.as_secs()
                    ))
                })?
                .map_err(|e| classify(&e))?;
            let Some(chunk) = chunk else { break };

            sink.write_all(&chunk)
                .await
                .map_err(|e| TransportError::Fatal(format!("Failed to write download: {e}")))?;
            written += chunk.len() as u64;
            progress.inc(chunk.len() as u64);
            trace!(%url, written, "Received chunk");
        }

        sink.flush()
            .await
            .map_err(|e| TransportError::Fatal(format!("Failed to flush download: {e}")))?;
        Ok(written)
    }
}

/// Transport for `file://` URLs, used for local mirrors.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTransport;

/// Convert a `file://` URL into a local path.
#[must_use]
pub fn file_url_to_path(url: &str) -> Option<PathBuf> {
    let rest = url.strip_prefix("file://")?;
    // file://localhost/path and file:///path are both accepted.
    let rest = rest.strip_prefix("localhost").unwrap_or(rest);
    if rest.is_empty() {
        return None;
    }
    // file:///C:/dir on Windows
    let bytes = rest.as_bytes();
    if bytes.len() > 2 && bytes[0] == b'/' && bytes[2] == b':' && bytes[1].is_ascii_alphabetic() {
        return Some(PathBuf::from(&rest[1..]));
    }
    Some(PathBuf::from(rest))
}

#[async_trait]
impl Transport for FileTransport {
    async fn fetch(
        &self,
        url: &str,
        sink: &mut File,
        progress: &ProgressBar,
    ) -> Result<u64, TransportError> {
        let path = file_url_to_path(url)
            .ok_or_else(|| TransportError::Fatal(format!("Not a file URL: {url}")))?;
        let mut source = File::open(&path)
            .await
            .map_err(|e| TransportError::Fatal(format!("Failed to open {}: {e}", path.display())))?;
        if let Ok(metadata) = source.metadata().await {
            progress.set_length(metadata.len());
        }

        let mut buffer = vec![0u8; 64 * 1024];
        let mut written = 0u64;
        loop {
            let n = source
                .read(&mut buffer)
                .await
                .map_err(|e| TransportError::Transient(format!("Failed to read {}: {e}", path.display())))?;
            if n == 0 {
                break;
            }
            sink.write_all(&buffer[..n])
                .await
                .map_err(|e| TransportError::Fatal(format!("Failed to write download: {e}")))?;
            written += n as u64;
            progress.inc(n as u64);
        }
        sink.flush()
            .await
            .map_err(|e| TransportError::Fatal(format!("Failed to flush download: {e}")))?;
        Ok(written)
    }
}

/// Routes each URL to a transport by scheme.
pub struct SchemeTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl SchemeTransport {
    /// Transport handling `https://`, `http://` and `file://`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be created.
    pub fn new() -> simplicity_core::Result<Self> {
        Ok(Self {
            http: HttpTransport::new()?,
            file: FileTransport,
        })
    }
}

#[async_trait]
impl Transport for SchemeTransport {
    async fn fetch(
        &self,
        url: &str,
        sink: &mut File,
        progress: &ProgressBar,
    ) -> Result<u64, TransportError> {
        let scheme = url.split_once("://").map(|(s, _)| s.to_ascii_lowercase());
        match scheme.as_deref() {
            Some("https" | "http") => self.http.fetch(url, sink, progress).await,
            Some("file") => self.file.fetch(url, sink, progress).await,
            _ => Err(TransportError::Fatal(format!("Unsupported URL scheme: {url}"))),
        }
    }
}
