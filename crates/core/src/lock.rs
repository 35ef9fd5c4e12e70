//! Advisory file locks.
//!
//! Installs are serialized per `(tool, version)` slot so unrelated tools and
//! versions install concurrently. Locks are `flock`-style (via `fs4`) and are
//! released when the holder drops, including when the process dies.

use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::layout::ToolsLayout;
use crate::{Error, Result, Stage};

/// How long to wait before telling the user we are blocked on another installer.
const WAIT_NOTICE_DELAY: Duration = Duration::from_millis(500);

fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
    }
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| Error::io(e, path, "open"))
}

/// Exclusive lock on one install slot.
#[derive(Debug)]
pub struct SlotLock {
    _file: File,
    path: PathBuf,
}

impl SlotLock {
    /// Acquire the lock for `(tool, version)`, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockTimeout`] if the lock is still held after
    /// `timeout`, or [`Error::Cancelled`] if `cancel` fires first.
    pub async fn acquire(
        layout: &ToolsLayout,
        tool: &str,
        version: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let path = layout.slot_lock_file(tool, version);
        let file = open_lock_file(&path)?;
        let started = Instant::now();

        // The blocking wait cannot be interrupted. If we give up, the task
        // finishes on its own and drops the file, which releases the lock.
        let mut wait = tokio::task::spawn_blocking(move || file.lock_exclusive().map(|()| file));
        let deadline = tokio::time::sleep(timeout);
        let notice = tokio::time::sleep(WAIT_NOTICE_DELAY);
        tokio::pin!(deadline, notice);
        let mut noticed = false;

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    return Err(Error::Cancelled {
                        tool: tool.to_string(),
                        version: Some(version.to_string()),
                        stage: Stage::Lock,
                        reason: "cancellation requested while waiting for install lock".into(),
                    });
                }
                joined = &mut wait => {
                    let file = joined
                        .map_err(|e| Error::io(std::io::Error::other(e), &path, "lock_exclusive"))?
                        .map_err(|e| Error::io(e, &path, "lock_exclusive"))?;
                    debug!(%tool, %version, waited_ms = started.elapsed().as_millis(), "Acquired slot lock");
                    return Ok(Self { _file: file, path });
                }
                () = &mut deadline => {
                    return Err(Error::LockTimeout {
                        tool: tool.to_string(),
                        version: version.to_string(),
                        waited_secs: started.elapsed().as_secs(),
                    });
                }
                () = &mut notice, if !noticed => {
                    noticed = true;
                    info!(%tool, %version, "Waiting for another process to finish installing");
                }
            }
        }
    }

    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Exclusive lock held for short critical sections such as registry updates.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

impl FileLock {
    /// Block until the lock on `path` is acquired.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the lock file cannot be opened or locked.
    pub fn exclusive(path: &Path) -> Result<Self> {
        let file = open_lock_file(path)?;
        file.lock_exclusive()
            .map_err(|e| Error::io(e, path, "lock_exclusive"))?;
        Ok(Self { _file: file })
    }
}
