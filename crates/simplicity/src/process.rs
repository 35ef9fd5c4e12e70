//! Child process execution for installed tools.
//!
//! Output is read in chunks and teed: each chunk is written to our own
//! stdout/stderr as it arrives (when forwarding) and appended to a buffer
//! (when capturing). Without capture the child inherits our streams directly,
//! which keeps interactive tools usable.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Exit code reported when the exit status carries neither a code nor a signal.
const UNKNOWN_EXIT_CODE: i32 = 1;

/// How a tool is invoked.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Write the child's output to our stdout/stderr as it arrives.
    pub forward_output: bool,
    /// Buffer the child's output into [`RunOutput`].
    pub capture_output: bool,
    /// Abort the whole operation (including an on-demand install) after this long.
    pub timeout: Option<Duration>,
    /// Caller-controlled cancellation.
    pub cancel: CancellationToken,
    /// Working directory for the child.
    pub current_dir: Option<PathBuf>,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            forward_output: true,
            capture_output: true,
            timeout: None,
            cancel: CancellationToken::new(),
            current_dir: None,
            env: Vec::new(),
        }
    }
}

impl RunOptions {
    /// Inherit stdio without buffering anything.
    #[must_use]
    pub fn passthrough() -> Self {
        Self {
            capture_output: false,
            ..Self::default()
        }
    }

    /// Buffer output without echoing it.
    #[must_use]
    pub fn captured() -> Self {
        Self {
            forward_output: false,
            ..Self::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use `cancel` as the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Result of a finished tool invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutput {
    /// The child's exit code; `128 + signal` if it was killed by a signal.
    pub exit_code: i32,
    /// Captured stdout, empty unless capturing.
    pub stdout: String,
    /// Captured stderr, empty unless capturing.
    pub stderr: String,
}

impl RunOutput {
    /// Whether the tool exited with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Why a child did not run to completion.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// The executable could not be started.
    #[error("failed to start {}: {source}", .program.display())]
    Spawn {
        /// Program that failed to start.
        program: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Waiting on the child failed.
    #[error("failed to wait for child: {0}")]
    Wait(std::io::Error),
    /// The cancellation token fired; the child was killed.
    #[error("child process killed after cancellation")]
    Cancelled,
}

/// Run `program` with `args` until it exits or `cancel` fires.
///
/// # Errors
///
/// Returns [`ProcessError::Spawn`] if the program cannot be started and
/// [`ProcessError::Cancelled`] if it was killed because `cancel` fired.
pub async fn execute(
    program: &Path,
    args: &[String],
    options: &RunOptions,
    cancel: &CancellationToken,
) -> Result<RunOutput, ProcessError> {
    let mut cmd = Command::new(program);
    cmd.args(args).stdin(Stdio::inherit()).kill_on_drop(true);
    if let Some(dir) = &options.current_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    let piped = options.capture_output;
    if piped {
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else if options.forward_output {
        cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
    } else {
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
    }

    debug!(program = %program.display(), ?args, piped, "Spawning tool");
    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        program: program.to_path_buf(),
        source,
    })?;

    let readers = piped.then(|| spawn_readers(&mut child, options.forward_output));

    let status = tokio::select! {
        biased;

        () = cancel.cancelled() => {
            warn!(program = %program.display(), "Cancellation requested, killing tool");
            if let Err(e) = child.kill().await {
                debug!(error = %e, "Failed to kill child");
            }
            if let Some((out, err)) = readers {
                out.abort();
                err.abort();
            }
            return Err(ProcessError::Cancelled);
        }
        status = child.wait() => status.map_err(ProcessError::Wait)?,
    };

    let (stdout, stderr) = match readers {
        Some((out, err)) => (collect(out).await, collect(err).await),
        None => (Vec::new(), Vec::new()),
    };

    let exit_code = exit_code(status);
    debug!(program = %program.display(), exit_code, "Tool exited");
    Ok(RunOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

fn spawn_readers(child: &mut Child, forward: bool) -> (JoinHandle<Vec<u8>>, JoinHandle<Vec<u8>>) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out = tokio::spawn(async move {
        match stdout {
            Some(pipe) => tee(pipe, forward.then(tokio::io::stdout)).await,
            None => Vec::new(),
        }
    });
    let err = tokio::spawn(async move {
        match stderr {
            Some(pipe) => tee(pipe, forward.then(tokio::io::stderr)).await,
            None => Vec::new(),
        }
    });
    (out, err)
}

/// Copy `source` into a buffer, echoing each chunk to `echo`.
async fn tee<R, W>(mut source: R, mut echo: Option<W>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut captured = Vec::new();
    let mut buffer = vec![0u8; 8 * 1024];
    loop {
        let n = match source.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "Stopped reading child output");
                break;
            }
        };
        if let Some(sink) = echo.as_mut() {
            // A closed terminal must not stop capture.
            if sink.write_all(&buffer[..n]).await.is_err() || sink.flush().await.is_err() {
                echo = None;
            }
        }
        captured.extend_from_slice(&buffer[..n]);
    }
    captured
}

async fn collect(handle: JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.await.unwrap_or_default()
}

/// Map an exit status to a shell-style exit code.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    UNKNOWN_EXIT_CODE
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let temp = tempfile::tempdir().unwrap();
        let exe = script(temp.path(), "tool", "echo out; echo err >&2; exit 3");

        let output = execute(&exe, &[], &RunOptions::captured(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_arguments_are_passed_verbatim() {
        let temp = tempfile::tempdir().unwrap();
        let exe = script(temp.path(), "tool", r#"for a in "$@"; do echo "[$a]"; done"#);
        let args = vec!["generate".to_string(), "two words".to_string()];

        let output = execute(&exe, &args, &RunOptions::captured(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.stdout, "[generate]\n[two words]\n");
    }

    #[tokio::test]
    async fn test_env_and_current_dir() {
        let temp = tempfile::tempdir().unwrap();
        let exe = script(temp.path(), "tool", r#"echo "$GREETING"; pwd"#);
        let workdir = tempfile::tempdir().unwrap();
        let options = RunOptions {
            current_dir: Some(workdir.path().to_path_buf()),
            env: vec![("GREETING".into(), "hello".into())],
            ..RunOptions::captured()
        };

        let output = execute(&exe, &[], &options, &CancellationToken::new())
            .await
            .unwrap();
        let mut lines = output.stdout.lines();
        assert_eq!(lines.next(), Some("hello"));
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            workdir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_passthrough_captures_nothing() {
        let temp = tempfile::tempdir().unwrap();
        let exe = script(temp.path(), "tool", "exit 0");
        let options = RunOptions {
            forward_output: false,
            capture_output: false,
            ..RunOptions::default()
        };

        let output = execute(&exe, &[], &options, &CancellationToken::new())
            .await
            .unwrap();
        assert!(output.success());
        assert!(output.stdout.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let temp = tempfile::tempdir().unwrap();
        let exe = script(temp.path(), "tool", "exec sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = execute(&exe, &[], &RunOptions::captured(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_signal_exit_code() {
        let temp = tempfile::tempdir().unwrap();
        let exe = script(temp.path(), "tool", "kill -9 $$");

        let output = execute(&exe, &[], &RunOptions::captured(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 137);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let temp = tempfile::tempdir().unwrap();
        let err = execute(
            &temp.path().join("missing"),
            &[],
            &RunOptions::captured(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }
}
