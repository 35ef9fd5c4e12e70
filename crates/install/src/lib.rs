//! Artifact download and installation for simplicity-tools.
//!
//! Turns an [`ArtifactDescriptor`](simplicity_core::ArtifactDescriptor) into an
//! installed executable:
//!
//! 1. [`Downloader`] streams the artifact through a [`Transport`] into the
//!    scratch area, retrying transient failures, and verifies its checksum.
//! 2. [`Installer`] extracts it into a private staging directory and renames
//!    the result into `<root>/<tool>/<version>` as a single final step.

pub mod download;
pub mod extract;
pub mod installer;
pub mod transport;

pub use download::{DownloadedArtifact, Downloader, RetryPolicy};
pub use installer::Installer;
pub use transport::{FileTransport, HttpTransport, SchemeTransport, Transport, TransportError};
