//! Platform-aware installer and runner for pinned command-line tools.
//!
//! `simplicity-tools` keeps a managed directory of vendor tools such as
//! Silicon Labs' `slc-cli` and `zap`. Asking for a tool resolves the build
//! for the current platform from a static catalog, downloads and verifies it,
//! installs it atomically, and records it, all on first use:
//!
//! ```no_run
//! use simplicity_core::VersionSpec;
//! use simplicity_tools::ToolRunner;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> simplicity_core::Result<()> {
//! let runner = ToolRunner::builder(simplicity_core::root_from_env()?).build()?;
//! let slc = runner
//!     .get_path("slc-cli", &VersionSpec::Latest, &CancellationToken::new())
//!     .await?;
//! println!("slc-cli lives at {}", slc.display());
//! # Ok(())
//! # }
//! ```
//!
//! The crate also ships the `simplicity-tools` binary; see [`cli`].

pub mod cli;
pub mod commands;
pub mod process;
pub mod runner;
pub mod tracing;

pub use process::{RunOptions, RunOutput};
pub use runner::{
    InstallOutcome, InstalledVersion, LinkAction, LinkOutcome, StatusReport, ToolRunner,
    ToolRunnerBuilder, ToolStatus,
};
