//! Command-line surface: argument parsing, error categories and exit codes.

use clap::{Parser, Subcommand};
use miette::{Diagnostic, Report};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::PathBuf;
use thiserror::Error;

use crate::tracing::{LogLevel, TracingFormat};

/// Success.
pub const EXIT_OK: i32 = 0;
/// Unexpected failure, including an unreadable registry.
pub const EXIT_OTHER: i32 = 1;
/// Bad arguments, catalog or configuration; unknown tool or version.
pub const EXIT_CONFIG: i32 = 2;
/// No artifact for this platform.
pub const EXIT_UNSUPPORTED_PLATFORM: i32 = 3;
/// Download failed after retries.
pub const EXIT_DOWNLOAD: i32 = 4;
/// Checksum mismatch.
pub const EXIT_INTEGRITY: i32 = 5;
/// Extraction or filesystem failure while installing.
pub const EXIT_INSTALL: i32 = 6;
/// Another process held the install lock too long.
pub const EXIT_LOCK_TIMEOUT: i32 = 7;
/// Interrupted (128 + SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

/// CLI error with its exit-code category.
#[derive(Error, Debug, Clone, Diagnostic)]
pub enum CliError {
    /// Configuration or usage problem (exit code 2)
    #[error("{message}")]
    #[diagnostic(code(simplicity::cli::config))]
    Config {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Host platform has no artifact (exit code 3)
    #[error("{message}")]
    #[diagnostic(code(simplicity::cli::unsupported_platform))]
    UnsupportedPlatform {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Download failure (exit code 4)
    #[error("{message}")]
    #[diagnostic(code(simplicity::cli::download))]
    Download {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Checksum mismatch (exit code 5)
    #[error("{message}")]
    #[diagnostic(code(simplicity::cli::integrity))]
    Integrity {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Install failure (exit code 6)
    #[error("{message}")]
    #[diagnostic(code(simplicity::cli::install))]
    Install {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Install lock contention (exit code 7)
    #[error("{message}")]
    #[diagnostic(code(simplicity::cli::lock_timeout))]
    LockTimeout {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
    /// Interrupted by the user or a timeout (exit code 130)
    #[error("{message}")]
    #[diagnostic(code(simplicity::cli::cancelled))]
    Cancelled {
        /// The error message
        message: String,
    },
    /// Anything else (exit code 1)
    #[error("{message}")]
    #[diagnostic(code(simplicity::cli::other))]
    Other {
        /// The error message
        message: String,
        /// Optional help text
        #[help]
        help: Option<String>,
    },
}

impl CliError {
    /// Configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: None,
        }
    }

    /// Configuration error with help text.
    #[must_use]
    pub fn config_with_help(message: impl Into<String>, help: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            help: Some(help.into()),
        }
    }

    /// Uncategorized error.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            help: None,
        }
    }

    /// Short machine-readable category, used in JSON error envelopes.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::UnsupportedPlatform { .. } => "unsupported_platform",
            Self::Download { .. } => "download",
            Self::Integrity { .. } => "integrity",
            Self::Install { .. } => "install",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::Other { .. } => "other",
        }
    }
}

impl From<simplicity_core::Error> for CliError {
    fn from(err: simplicity_core::Error) -> Self {
        use simplicity_core::Error as E;

        let message = err.to_string();
        match err {
            E::UnsupportedPlatform { .. } => Self::UnsupportedPlatform {
                message,
                help: Some("Run 'simplicity-tools info' to list the platforms each tool supports".into()),
            },
            E::UnknownTool { known, .. } => Self::config_with_help(
                message,
                format!("Known tools: {}", known.join(", ")),
            ),
            E::UnknownVersion { tool, .. } => Self::config_with_help(
                message,
                format!("Run 'simplicity-tools versions {tool}' to list catalogued versions"),
            ),
            E::Configuration(_) => Self::config(message),
            E::Download { .. } => Self::Download {
                message,
                help: Some("Check network access to the download host and try again".into()),
            },
            E::Integrity { .. } => Self::Integrity {
                message,
                help: Some(
                    "The downloaded file does not match the catalogued checksum; it was discarded"
                        .into(),
                ),
            },
            E::Install { .. } => Self::Install {
                message,
                help: Some("Check free disk space and permissions on the tools directory".into()),
            },
            E::LockTimeout { .. } => Self::LockTimeout {
                message,
                help: Some("Another process is installing the same tool; retry when it finishes".into()),
            },
            E::Cancelled { .. } => Self::Cancelled { message },
            E::Io { .. } => Self::Other {
                message,
                help: Some("Check file permissions and ensure the path exists".into()),
            },
            E::Registry { .. } | E::Run { .. } => Self::other(message),
        }
    }
}

/// Map a CLI error to its exit code.
#[must_use]
pub const fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Config { .. } => EXIT_CONFIG,
        CliError::UnsupportedPlatform { .. } => EXIT_UNSUPPORTED_PLATFORM,
        CliError::Download { .. } => EXIT_DOWNLOAD,
        CliError::Integrity { .. } => EXIT_INTEGRITY,
        CliError::Install { .. } => EXIT_INSTALL,
        CliError::LockTimeout { .. } => EXIT_LOCK_TIMEOUT,
        CliError::Cancelled { .. } => EXIT_CANCELLED,
        CliError::Other { .. } => EXIT_OTHER,
    }
}

/// Print `err` as a JSON envelope on stdout or a miette report on stderr.
#[allow(clippy::print_stdout, clippy::print_stderr)]
pub fn render_error(err: &CliError, json_mode: bool) {
    if json_mode {
        let envelope = ErrorEnvelope::new(serde_json::json!({
            "code": err.kind(),
            "exit_code": exit_code_for(err),
            "message": err.to_string(),
        }));
        match serde_json::to_string(&envelope) {
            Ok(json) => println!("{json}"),
            Err(_) => eprintln!("Error serializing error response"),
        }
    } else {
        let report = Report::new(err.clone());
        eprintln!("{report:?}");
        let _ = io::stderr().flush();
    }
}

/// Success envelope for `--json` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkEnvelope<T> {
    /// Always `"ok"`
    pub status: &'static str,
    /// Command payload
    pub data: T,
}

impl<T> OkEnvelope<T> {
    /// Wrap `data`.
    #[must_use]
    pub const fn new(data: T) -> Self {
        Self { status: "ok", data }
    }
}

/// Error envelope for `--json` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope<E> {
    /// Always `"error"`
    pub status: &'static str,
    /// Error details
    pub error: E,
}

impl<E> ErrorEnvelope<E> {
    /// Wrap `error`.
    #[must_use]
    pub const fn new(error: E) -> Self {
        Self {
            status: "error",
            error,
        }
    }
}

/// Installs and runs pinned builds of slc-cli, zap and other command-line tools.
#[derive(Parser, Debug)]
#[command(name = "simplicity-tools")]
#[command(about = "Install and run platform-specific builds of slc-cli, zap and friends")]
#[command(long_about = None)]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Managed tools directory.
    #[arg(
        long,
        global = true,
        value_name = "DIR",
        help = "Tools directory [default: $SIMPLICITY_TOOLS_DIR or ~/.simplicity-tools]"
    )]
    pub tools_dir: Option<PathBuf>,

    /// Custom catalog file.
    #[arg(long, global = true, value_name = "FILE", help = "Use a TOML catalog instead of the built-in one")]
    pub catalog: Option<PathBuf>,

    /// Platform override.
    #[arg(long, global = true, value_name = "OS-ARCH", help = "Resolve tools for another platform, e.g. linux-arm64")]
    pub platform: Option<String>,

    /// Logging verbosity level.
    #[arg(
        short = 'L',
        long,
        global = true,
        help = "Set logging level",
        default_value = "warn",
        value_enum
    )]
    pub level: LogLevel,

    /// Log output format.
    #[arg(long, global = true, default_value = "compact", value_enum, help = "Log output format")]
    pub log_format: TracingFormat,

    /// Emit JSON envelopes.
    #[arg(long, global = true, help = "Emit JSON output")]
    pub json: bool,

    /// Hide the download progress bar.
    #[arg(long, global = true, help = "Do not show download progress")]
    pub no_progress: bool,

    /// Hash executables on every use.
    #[arg(long, global = true, help = "Verify executable checksums before every use")]
    pub verify: bool,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Install one tool or all of them.
    #[command(about = "Install a tool, or every catalogued tool")]
    Install {
        /// Tool name or `all`.
        #[arg(default_value = "all")]
        tool: String,
        /// Version to install.
        #[arg(long, help = "Version to install [default: latest]")]
        version: Option<String>,
    },

    /// Remove installed versions.
    #[command(about = "Remove an installed tool, or all of them")]
    Uninstall {
        /// Tool name or `all`.
        tool: String,
        /// Remove only this version.
        #[arg(long, help = "Remove only this version")]
        version: Option<String>,
    },

    /// Installed tools, versions and paths.
    #[command(about = "Show installed tools")]
    Status,

    /// Platform and catalog details.
    #[command(about = "Show platform, tools directory and catalog details")]
    Info,

    /// Catalogued versions of a tool.
    #[command(about = "List catalogued versions of a tool")]
    Versions {
        /// Tool name.
        tool: String,
    },

    /// Print the executable path, installing first if needed.
    #[command(about = "Print the path of a tool's executable")]
    Path {
        /// Tool name.
        tool: String,
        /// Version.
        #[arg(long, help = "Version [default: latest]")]
        version: Option<String>,
    },

    /// Run a tool.
    #[command(about = "Run a tool, installing it first if needed")]
    Run {
        /// Tool name.
        tool: String,
        /// Version.
        #[arg(long, help = "Version [default: latest]")]
        version: Option<String>,
        /// Buffer output and print it as one JSON object.
        #[arg(long, help = "Capture output and print it as JSON")]
        capture_output: bool,
        /// Timeout in seconds.
        #[arg(long, value_name = "SECONDS", help = "Kill the tool after this many seconds")]
        timeout: Option<u64>,
        /// Arguments passed to the tool.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Delete the scratch area.
    #[command(about = "Delete temporary downloads and staging directories")]
    Clean,

    /// Symlink executables into a directory.
    #[command(about = "Symlink installed executables into a directory on PATH")]
    LinkBinaries {
        /// Directory to place links in.
        #[arg(long, value_name = "DIR")]
        target: PathBuf,
        /// Replace existing files.
        #[arg(long, help = "Replace existing files")]
        force: bool,
    },

    /// `<tool> [args...]`: install if needed and forward.
    #[command(external_subcommand)]
    External(Vec<String>),
}

impl Commands {
    /// Name used for the command span.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Install { .. } => "install",
            Self::Uninstall { .. } => "uninstall",
            Self::Status => "status",
            Self::Info => "info",
            Self::Versions { .. } => "versions",
            Self::Path { .. } => "path",
            Self::Run { .. } => "run",
            Self::Clean => "clean",
            Self::LinkBinaries { .. } => "link-binaries",
            Self::External(args) => args.first().map_or("external", String::as_str),
        }
    }
}

/// Parse the process arguments.
#[must_use]
pub fn parse() -> Cli {
    Cli::parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use simplicity_core::{Error, Stage};

    #[test]
    fn test_exit_codes_per_category() {
        let cases = [
            (
                Error::UnsupportedPlatform {
                    platform: "linux-arm32".into(),
                    tool: Some("zap".into()),
                    version: Some("1.0.0".into()),
                },
                EXIT_UNSUPPORTED_PLATFORM,
            ),
            (
                Error::UnknownTool {
                    tool: "nope".into(),
                    known: vec!["slc-cli".into(), "zap".into()],
                },
                EXIT_CONFIG,
            ),
            (
                Error::LockTimeout {
                    tool: "zap".into(),
                    version: "2025.05.07".into(),
                    waited_secs: 600,
                },
                EXIT_LOCK_TIMEOUT,
            ),
            (
                Error::Cancelled {
                    tool: "zap".into(),
                    version: None,
                    stage: Stage::Download,
                    reason: "interrupted".into(),
                },
                EXIT_CANCELLED,
            ),
            (Error::registry("/tmp/.registry", "bad json"), EXIT_OTHER),
            (Error::configuration("bad catalog"), EXIT_CONFIG),
        ];
        for (err, code) in cases {
            let cli = CliError::from(err);
            assert_eq!(exit_code_for(&cli), code, "{cli:?}");
        }
    }

    #[test]
    fn test_unknown_tool_help_lists_known_tools() {
        let cli = CliError::from(Error::UnknownTool {
            tool: "nope".into(),
            known: vec!["slc-cli".into(), "zap".into()],
        });
        match cli {
            CliError::Config { help, .. } => {
                assert_eq!(help.as_deref(), Some("Known tools: slc-cli, zap"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_run_with_hyphen_args() {
        let cli = Cli::try_parse_from([
            "simplicity-tools",
            "run",
            "slc-cli",
            "--version",
            "4.2.0",
            "--",
            "generate",
            "-p",
            "app.slcp",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { tool, version, args, .. } => {
                assert_eq!(tool, "slc-cli");
                assert_eq!(version.as_deref(), Some("4.2.0"));
                assert_eq!(args, ["generate", "-p", "app.slcp"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_parse_external_subcommand() {
        let cli = Cli::try_parse_from(["simplicity-tools", "zap", "--help", "-x"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::External(vec!["zap".into(), "--help".into(), "-x".into()])
        );
        assert_eq!(cli.command.name(), "zap");
    }

    #[test]
    fn test_parse_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "simplicity-tools",
            "status",
            "--json",
            "--tools-dir",
            "/tmp/tools",
        ])
        .unwrap();
        assert!(cli.json);
        assert_eq!(cli.tools_dir, Some(PathBuf::from("/tmp/tools")));
        assert_eq!(cli.command, Commands::Status);
    }

    #[test]
    fn test_install_defaults_to_all() {
        let cli = Cli::try_parse_from(["simplicity-tools", "install"]).unwrap();
        assert_eq!(
            cli.command,
            Commands::Install {
                tool: "all".into(),
                version: None
            }
        );
    }
}
