//! The [`ToolRunner`] facade.
//!
//! A runner ties the pipeline together for one managed root:
//!
//! ```text
//! detect -> resolve -> registry lookup --hit--> done
//!                            |
//!                           miss -> slot lock -> re-check -> fetch -> install -> record
//! ```
//!
//! # Example
//!
//! ```no_run
//! use simplicity_tools::{RunOptions, ToolRunner};
//! use simplicity_core::VersionSpec;
//!
//! # async fn demo() -> simplicity_core::Result<()> {
//! let runner = ToolRunner::builder("/opt/simplicity-tools").build()?;
//! let output = runner
//!     .run("slc-cli", &VersionSpec::Latest, &["--version".into()], RunOptions::captured())
//!     .await?;
//! println!("{}", output.stdout);
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use simplicity_core::{
    ArtifactCatalog, ArtifactDescriptor, Error, InstalledTool, PlatformDetector, PlatformKey,
    Result, SlotLock, Stage, ToolRegistry, ToolsLayout, VersionSpec, validate_component,
};
use simplicity_install::{Downloader, Installer, RetryPolicy, SchemeTransport, Transport};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::process::{self, ProcessError, RunOptions, RunOutput};

/// How long to wait for another process installing the same slot.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Builder for [`ToolRunner`].
pub struct ToolRunnerBuilder {
    root: PathBuf,
    catalog: Option<ArtifactCatalog>,
    detector: PlatformDetector,
    transport: Option<Arc<dyn Transport>>,
    retry: RetryPolicy,
    lock_timeout: Duration,
    show_progress: bool,
    verify_on_use: bool,
}

impl ToolRunnerBuilder {
    /// Builder for a runner managing `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            catalog: None,
            detector: PlatformDetector::new(),
            transport: None,
            retry: RetryPolicy::default(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            show_progress: false,
            verify_on_use: false,
        }
    }

    /// Use `catalog` instead of the built-in one.
    #[must_use]
    pub fn catalog(mut self, catalog: ArtifactCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Pretend to run on `platform`.
    #[must_use]
    pub fn platform(mut self, platform: PlatformKey) -> Self {
        self.detector = PlatformDetector::fixed(platform);
        self
    }

    /// Use a custom detector.
    #[must_use]
    pub fn detector(mut self, detector: PlatformDetector) -> Self {
        self.detector = detector;
        self
    }

    /// Fetch artifacts through `transport` instead of HTTP/file.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Download retry policy.
    #[must_use]
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Ceiling on waiting for another installer of the same slot.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Show download progress on stderr.
    #[must_use]
    pub fn show_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Hash the executable on every lookup instead of checking size only.
    #[must_use]
    pub fn verify_on_use(mut self, verify: bool) -> Self {
        self.verify_on_use = verify;
        self
    }

    /// Build the runner.
    ///
    /// # Errors
    ///
    /// Returns an error if the root cannot be made absolute, the built-in
    /// catalog is invalid, or the HTTP client cannot be created.
    pub fn build(self) -> Result<ToolRunner> {
        let root = std::path::absolute(&self.root)
            .map_err(|e| Error::io(e, &self.root, "absolute"))?;
        let layout = ToolsLayout::new(root);
        let catalog = match self.catalog {
            Some(catalog) => catalog,
            None => ArtifactCatalog::builtin()?,
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(SchemeTransport::new()?),
        };

        Ok(ToolRunner {
            registry: ToolRegistry::new(layout.clone()),
            downloader: Downloader::new(layout.clone(), transport)
                .with_retry(self.retry)
                .with_progress(self.show_progress),
            installer: Installer::new(layout.clone()),
            layout,
            catalog: Arc::new(catalog),
            detector: self.detector,
            lock_timeout: self.lock_timeout,
            verify_on_use: self.verify_on_use,
        })
    }
}

/// Installs tools on demand and runs them.
///
/// Cheap to clone; clones share the catalog and transport.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    layout: ToolsLayout,
    catalog: Arc<ArtifactCatalog>,
    detector: PlatformDetector,
    registry: ToolRegistry,
    downloader: Downloader,
    installer: Installer,
    lock_timeout: Duration,
    verify_on_use: bool,
}

/// Outcome of installing one tool as part of [`ToolRunner::install_all`].
#[derive(Debug)]
pub struct InstallOutcome {
    /// Tool name.
    pub tool: String,
    /// The installed record, or why it failed.
    pub result: Result<InstalledTool>,
}

/// Snapshot returned by [`ToolRunner::status`].
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Detected platform, if the host is supported.
    pub platform: Option<PlatformKey>,
    /// Why detection failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform_error: Option<String>,
    /// Whether every catalogued tool has an artifact for this platform.
    pub platform_supported: bool,
    /// The managed root.
    pub root: PathBuf,
    /// One entry per catalogued or installed tool.
    pub tools: Vec<ToolStatus>,
}

/// Status of one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    /// Tool name.
    pub tool: String,
    /// Version `latest` resolves to, if the tool is catalogued.
    pub latest: Option<String>,
    /// Whether the latest version has an artifact for this platform.
    pub supported: bool,
    /// Installed versions.
    pub installed: Vec<InstalledVersion>,
}

/// One installed version in a [`ToolStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct InstalledVersion {
    /// Version string.
    pub version: String,
    /// Executable path.
    pub path: PathBuf,
    /// Whether the executable is still present and intact.
    pub valid: bool,
    /// Whether the artifact matched a catalogued checksum.
    pub checksum_verified: bool,
    /// When it was installed.
    pub installed_at: chrono::DateTime<chrono::Utc>,
}

/// What [`ToolRunner::link_binaries`] did for one tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkOutcome {
    /// Tool name.
    pub tool: String,
    /// The link path.
    pub link: PathBuf,
    /// What the link points at.
    pub target: PathBuf,
    /// What happened.
    pub action: LinkAction,
}

/// Result of linking one executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkAction {
    /// New link created.
    Created,
    /// Existing file replaced (`force`).
    Replaced,
    /// Existing link already pointed at the target.
    Unchanged,
    /// A different file exists and `force` was not given.
    Skipped,
}

impl ToolRunner {
    /// Start configuring a runner for `root`.
    #[must_use]
    pub fn builder(root: impl Into<PathBuf>) -> ToolRunnerBuilder {
        ToolRunnerBuilder::new(root)
    }

    /// The managed root.
    #[must_use]
    pub fn layout(&self) -> &ToolsLayout {
        &self.layout
    }

    /// The catalog in use.
    #[must_use]
    pub fn catalog(&self) -> &ArtifactCatalog {
        &self.catalog
    }

    /// The installed-tool registry.
    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// The platform tools are resolved for.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnsupportedPlatform`] if the host is not in the enumeration.
    pub fn platform(&self) -> Result<PlatformKey> {
        self.detector.detect()
    }

    /// Resolve `spec` for this platform without touching the filesystem.
    ///
    /// # Errors
    ///
    /// Returns a detection or resolution error.
    pub fn resolve(&self, tool: &str, spec: &VersionSpec) -> Result<ArtifactDescriptor> {
        let platform = self.detector.detect()?;
        self.catalog.resolve(tool, spec, platform)
    }

    /// Return the installed record for `tool`, installing it first if needed.
    ///
    /// When the tool is already installed and intact this is a registry read
    /// plus a stat of the executable. Otherwise the slot lock is taken, the
    /// registry re-checked (another process may have finished meanwhile), and
    /// the artifact downloaded, installed and recorded.
    ///
    /// # Errors
    ///
    /// Any error of the pipeline: resolution errors before any side effect,
    /// then [`Error::LockTimeout`], [`Error::Download`], [`Error::Integrity`],
    /// [`Error::Install`], [`Error::Registry`] or [`Error::Cancelled`].
    pub async fn ensure_installed(
        &self,
        tool: &str,
        spec: &VersionSpec,
        cancel: &CancellationToken,
    ) -> Result<InstalledTool> {
        let descriptor = self.resolve(tool, spec)?;
        let version = descriptor.version.as_str();

        if let Some(entry) = self.registry.lookup(tool, version)?
            && self.is_usable(&entry)
        {
            debug!(%tool, %version, path = %entry.executable_path.display(), "Already installed");
            return Ok(entry);
        }

        self.layout.ensure_dirs()?;
        let _lock =
            SlotLock::acquire(&self.layout, tool, version, self.lock_timeout, cancel).await?;

        match self.registry.lookup(tool, version)? {
            Some(entry) if self.is_usable(&entry) => {
                debug!(%tool, %version, "Installed by another process while waiting");
                return Ok(entry);
            }
            Some(entry) => {
                warn!(
                    %tool,
                    %version,
                    path = %entry.executable_path.display(),
                    "Installed executable is missing or modified, reinstalling"
                );
                self.remove_slot(tool, version).await?;
            }
            None if self.layout.slot_dir(tool, version).exists() => {
                debug!(%tool, %version, "Removing unrecorded slot");
                self.remove_slot(tool, version).await?;
            }
            None => {}
        }

        info!(
            %tool,
            %version,
            platform = %descriptor.platform,
            url = %descriptor.url,
            "Installing tool"
        );
        let artifact = self.downloader.fetch(&descriptor, cancel).await?;
        if cancel.is_cancelled() {
            return Err(cancelled(tool, version, Stage::Install, "cancelled before install"));
        }

        let installer = self.installer.clone();
        let staged = descriptor.clone();
        let installed = tokio::task::spawn_blocking(move || installer.install(&staged, &artifact))
            .await
            .map_err(|e| Error::Install {
                tool: tool.to_string(),
                version: version.to_string(),
                platform: descriptor.platform.to_string(),
                message: format!("install task failed: {e}"),
            })??;

        let entry = installed.clone();
        self.with_registry(move |registry| registry.record(entry)).await?;
        Ok(installed)
    }

    async fn remove_slot(&self, tool: &str, version: &str) -> Result<Option<InstalledTool>> {
        let (tool, version) = (tool.to_string(), version.to_string());
        self.with_registry(move |registry| registry.remove(&tool, &version))
            .await
    }

    /// Run a registry mutation on the blocking pool; it waits on a file lock.
    async fn with_registry<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ToolRegistry) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || f(&registry))
            .await
            .map_err(|e| {
                Error::registry(
                    self.layout.registry_file(),
                    format!("registry task failed: {e}"),
                )
            })?
    }

    /// Absolute path of the executable, installing it first if needed.
    ///
    /// # Errors
    ///
    /// See [`ensure_installed`](Self::ensure_installed).
    pub async fn get_path(
        &self,
        tool: &str,
        spec: &VersionSpec,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        Ok(self.ensure_installed(tool, spec, cancel).await?.executable_path)
    }

    /// Install `tool` if needed, then run it with `args`.
    ///
    /// The tool's exit code is returned as-is in [`RunOutput`]; a non-zero
    /// code is not an error. `options.timeout` covers the whole call,
    /// including an on-demand download.
    ///
    /// # Errors
    ///
    /// Errors of [`ensure_installed`](Self::ensure_installed),
    /// [`Error::Run`] if the executable cannot be started, and
    /// [`Error::Cancelled`] if the token fires or the timeout elapses.
    pub async fn run(
        &self,
        tool: &str,
        spec: &VersionSpec,
        args: &[String],
        options: RunOptions,
    ) -> Result<RunOutput> {
        let cancel = options.cancel.child_token();
        let timer = options.timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        });

        let result = self.run_inner(tool, spec, args, &options, &cancel).await;
        if let Some(timer) = timer {
            timer.abort();
        }

        match (result, options.timeout) {
            (Err(Error::Cancelled { tool, version, stage, .. }), Some(timeout))
                if !options.cancel.is_cancelled() =>
            {
                Err(Error::Cancelled {
                    tool,
                    version,
                    stage,
                    reason: format!("timed out after {}s", timeout.as_secs_f64()),
                })
            }
            (result, _) => result,
        }
    }

    async fn run_inner(
        &self,
        tool: &str,
        spec: &VersionSpec,
        args: &[String],
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutput> {
        let installed = self.ensure_installed(tool, spec, cancel).await?;
        info!(%tool, version = %installed.version, ?args, "Running tool");

        process::execute(&installed.executable_path, args, options, cancel)
            .await
            .map_err(|e| match e {
                ProcessError::Cancelled => {
                    cancelled(tool, &installed.version, Stage::Run, "cancellation requested")
                }
                other => Error::Run {
                    tool: tool.to_string(),
                    version: installed.version.clone(),
                    message: other.to_string(),
                },
            })
    }

    /// Remove `tool`, either one version or every installed version.
    ///
    /// Returns the records that were removed; an empty list if nothing was
    /// installed.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `tool` or `version` is not a plain
    /// name, [`Error::LockTimeout`] if a slot is being installed and the lock
    /// cannot be taken, or [`Error::Registry`] / [`Error::Io`] on filesystem failures.
    pub async fn uninstall(&self, tool: &str, version: Option<&str>) -> Result<Vec<InstalledTool>> {
        validate_component("tool", tool)?;
        if let Some(version) = version {
            validate_component("version", version)?;
        }

        let versions: Vec<String> = match version {
            Some(version) => vec![version.to_string()],
            None => self
                .registry
                .installed_versions(tool)?
                .into_iter()
                .map(|entry| entry.version)
                .collect(),
        };

        let never = CancellationToken::new();
        let mut removed = Vec::new();
        for version in versions {
            let _lock =
                SlotLock::acquire(&self.layout, tool, &version, self.lock_timeout, &never).await?;
            if let Some(entry) = self.remove_slot(tool, &version).await? {
                removed.push(entry);
            }
        }
        Ok(removed)
    }

    /// Install the latest version of every catalogued tool.
    ///
    /// Continues past failures; stops early only on cancellation.
    pub async fn install_all(&self, cancel: &CancellationToken) -> Vec<InstallOutcome> {
        let mut outcomes = Vec::new();
        for tool in self.catalog.tools() {
            if cancel.is_cancelled() {
                break;
            }
            let result = self.ensure_installed(tool, &VersionSpec::Latest, cancel).await;
            if let Err(e) = &result {
                warn!(%tool, error = %e, "Install failed");
            }
            outcomes.push(InstallOutcome {
                tool: tool.to_string(),
                result,
            });
        }
        outcomes
    }

    /// Catalogued versions of `tool`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTool`] if the tool is not catalogued.
    pub fn available_versions(&self, tool: &str) -> Result<Vec<String>> {
        self.catalog.versions(tool)
    }

    /// Platform, support flag and installed versions of every tool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Registry`] only if the registry file is unreadable.
    pub fn status(&self) -> Result<StatusReport> {
        let (platform, platform_error) = match self.detector.detect() {
            Ok(platform) => (Some(platform), None),
            Err(e) => (None, Some(e.to_string())),
        };

        let installed = self.registry.list()?;
        let mut names: Vec<String> = self.catalog.tools().map(str::to_string).collect();
        for entry in &installed {
            if !names.contains(&entry.tool) {
                names.push(entry.tool.clone());
            }
        }

        let tools: Vec<ToolStatus> = names
            .into_iter()
            .map(|tool| {
                let latest = self.catalog.resolve_version(&tool, &VersionSpec::Latest).ok();
                let supported = match (platform, &latest) {
                    (Some(platform), Some(version)) => self
                        .catalog
                        .platforms(&tool, version)
                        .is_ok_and(|platforms| platforms.contains(&platform)),
                    _ => false,
                };
                let versions = installed
                    .iter()
                    .filter(|entry| entry.tool == tool)
                    .map(|entry| InstalledVersion {
                        version: entry.version.clone(),
                        path: entry.executable_path.clone(),
                        valid: self.registry.is_valid(entry),
                        checksum_verified: entry.checksum_verified,
                        installed_at: entry.installed_at,
                    })
                    .collect();
                ToolStatus {
                    tool,
                    latest,
                    supported,
                    installed: versions,
                }
            })
            .collect();

        let platform_supported = tools
            .iter()
            .filter(|status| status.latest.is_some())
            .all(|status| status.supported);

        Ok(StatusReport {
            platform,
            platform_error,
            platform_supported: platform.is_some() && platform_supported,
            root: self.layout.root().to_path_buf(),
            tools,
        })
    }

    /// Delete the scratch area. Only safe while no other process is installing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be removed.
    pub fn clean_scratch(&self) -> Result<()> {
        let scratch = self.layout.scratch_dir();
        match std::fs::remove_dir_all(&scratch) {
            Ok(()) => {
                info!(path = %scratch.display(), "Removed scratch directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &scratch, "remove_dir_all")),
        }
    }

    /// Symlink the newest installed version of each tool into `target_dir`.
    ///
    /// Links are named after the catalogued executable. An existing file is
    /// left alone unless `force` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] on platforms without symlink support
    /// for this purpose, [`Error::Registry`] if the registry is unreadable, or
    /// [`Error::Io`] if a link cannot be created.
    pub fn link_binaries(&self, target_dir: &Path, force: bool) -> Result<Vec<LinkOutcome>> {
        let mut newest: Vec<InstalledTool> = Vec::new();
        for entry in self.registry.list()? {
            if !self.registry.is_valid(&entry) {
                debug!(tool = %entry.tool, version = %entry.version, "Skipping invalid install");
                continue;
            }
            match newest.iter_mut().find(|e| e.tool == entry.tool) {
                Some(current)
                    if simplicity_core::catalog::compare_versions(&entry.version, &current.version)
                        .is_gt() =>
                {
                    *current = entry;
                }
                Some(_) => {}
                None => newest.push(entry),
            }
        }

        std::fs::create_dir_all(target_dir)
            .map_err(|e| Error::io(e, target_dir, "create_dir_all"))?;
        newest
            .into_iter()
            .map(|entry| {
                let name = entry
                    .executable_path
                    .file_name()
                    .map_or_else(|| OsString::from(&entry.tool), ToOwned::to_owned);
                let link = target_dir.join(name);
                let action = place_link(&entry.executable_path, &link, force)?;
                info!(tool = %entry.tool, link = %link.display(), ?action, "Linked executable");
                Ok(LinkOutcome {
                    tool: entry.tool,
                    link,
                    target: entry.executable_path,
                    action,
                })
            })
            .collect()
    }

    fn is_usable(&self, entry: &InstalledTool) -> bool {
        if self.verify_on_use {
            self.registry.verify(entry)
        } else {
            self.registry.is_valid(entry)
        }
    }
}

fn cancelled(tool: &str, version: &str, stage: Stage, reason: &str) -> Error {
    Error::Cancelled {
        tool: tool.to_string(),
        version: Some(version.to_string()),
        stage,
        reason: reason.to_string(),
    }
}

#[cfg(unix)]
fn place_link(target: &Path, link: &Path, force: bool) -> Result<LinkAction> {
    let existing = std::fs::symlink_metadata(link).ok();
    let action = match existing {
        None => LinkAction::Created,
        Some(_) if std::fs::read_link(link).is_ok_and(|current| current == target) => {
            return Ok(LinkAction::Unchanged);
        }
        Some(_) if !force => return Ok(LinkAction::Skipped),
        Some(metadata) if metadata.is_dir() => {
            return Err(Error::configuration(format!(
                "Refusing to replace directory {}",
                link.display()
            )));
        }
        Some(_) => {
            std::fs::remove_file(link).map_err(|e| Error::io(e, link, "remove_file"))?;
            LinkAction::Replaced
        }
    };
    std::os::unix::fs::symlink(target, link).map_err(|e| Error::io(e, link, "symlink"))?;
    Ok(action)
}

#[cfg(not(unix))]
fn place_link(_target: &Path, _link: &Path, _force: bool) -> Result<LinkAction> {
    Err(Error::configuration(
        "link-binaries is only supported on Unix platforms",
    ))
}
