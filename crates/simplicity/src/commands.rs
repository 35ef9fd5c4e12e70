//! Command handlers.
//!
//! Each handler returns the process exit code. Errors are returned as
//! [`CliError`] and rendered by the binary.

#![allow(clippy::print_stdout)]

use serde::Serialize;
use simplicity_core::{ArtifactCatalog, PlatformKey, VersionSpec, root_from_env};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cli::{Cli, CliError, Commands, EXIT_OK, OkEnvelope, exit_code_for};
use crate::process::RunOptions;
use crate::runner::{LinkAction, ToolRunner};

/// Keyword selecting every tool in `install` and `uninstall`.
const ALL_TOOLS: &str = "all";

/// Build the runner described by the global flags.
///
/// # Errors
///
/// Returns a configuration error for an unknown `--platform`, an unreadable
/// `--catalog`, or an undeterminable tools directory.
pub fn build_runner(cli: &Cli) -> Result<ToolRunner, CliError> {
    let root = match &cli.tools_dir {
        Some(dir) => dir.clone(),
        None => root_from_env()?,
    };
    let mut builder = ToolRunner::builder(root)
        .show_progress(!cli.json && !cli.no_progress)
        .verify_on_use(cli.verify);

    if let Some(path) = &cli.catalog {
        builder = builder.catalog(ArtifactCatalog::load(path)?);
    }
    if let Some(raw) = &cli.platform {
        let platform = PlatformKey::parse(raw).ok_or_else(|| {
            CliError::config_with_help(
                format!("Unknown platform '{raw}'"),
                "Use <os>-<arch>, e.g. linux-x64, macos-arm64, windows-x86",
            )
        })?;
        builder = builder.platform(platform);
    }
    Ok(builder.build()?)
}

/// Run the parsed command.
///
/// # Errors
///
/// Returns the first error the command hit.
pub async fn execute(cli: Cli, cancel: CancellationToken) -> Result<i32, CliError> {
    let runner = build_runner(&cli)?;
    let span = crate::command_span!(cli.command.name(), root = %runner.layout().root().display());
    let json = cli.json;

    async move {
        match cli.command {
            Commands::Install { tool, version } => {
                install(&runner, &tool, version.as_deref(), json, &cancel).await
            }
            Commands::Uninstall { tool, version } => {
                uninstall(&runner, &tool, version.as_deref(), json).await
            }
            Commands::Status => status(&runner, json),
            Commands::Info => info(&runner, json),
            Commands::Versions { tool } => versions(&runner, &tool, json),
            Commands::Path { tool, version } => {
                let spec = VersionSpec::from(version.as_deref());
                let path = runner.get_path(&tool, &spec, &cancel).await?;
                emit(json, &path, || path.display().to_string())
            }
            Commands::Run {
                tool,
                version,
                capture_output,
                timeout,
                args,
            } => {
                let options = RunOptions {
                    forward_output: !capture_output,
                    capture_output,
                    timeout: timeout.map(Duration::from_secs),
                    cancel,
                    ..RunOptions::default()
                };
                run(&runner, &tool, version.as_deref(), &args, options, capture_output || json)
                    .await
            }
            Commands::Clean => {
                runner.clean_scratch()?;
                emit(json, &serde_json::json!({ "cleaned": runner.layout().scratch_dir() }), || {
                    format!("Removed {}", runner.layout().scratch_dir().display())
                })
            }
            Commands::LinkBinaries { target, force } => link(&runner, &target, force, json),
            Commands::External(mut args) => {
                if args.is_empty() {
                    return Err(CliError::config("No tool given"));
                }
                let tool = args.remove(0);
                let options = RunOptions::passthrough().with_cancel(cancel);
                run(&runner, &tool, None, &args, options, false).await
            }
        }
    }
    .instrument(span)
    .await
}

fn emit<T: Serialize>(json: bool, data: &T, text: impl FnOnce() -> String) -> Result<i32, CliError> {
    if json {
        let out = serde_json::to_string_pretty(&OkEnvelope::new(data))
            .map_err(|e| CliError::other(format!("Failed to serialize output: {e}")))?;
        println!("{out}");
    } else {
        let text = text();
        if !text.is_empty() {
            println!("{text}");
        }
    }
    Ok(EXIT_OK)
}

#[derive(Serialize)]
struct InstallSummary {
    tool: String,
    version: Option<String>,
    path: Option<String>,
    checksum_verified: Option<bool>,
    error: Option<String>,
}

async fn install(
    runner: &ToolRunner,
    tool: &str,
    version: Option<&str>,
    json: bool,
    cancel: &CancellationToken,
) -> Result<i32, CliError> {
    if tool != ALL_TOOLS {
        let spec = VersionSpec::from(version);
        let installed = runner.ensure_installed(tool, &spec, cancel).await?;
        return emit(json, &installed, || {
            format!(
                "{} {} installed at {}",
                installed.tool,
                installed.version,
                installed.executable_path.display()
            )
        });
    }
    if version.is_some() {
        return Err(CliError::config("--version cannot be combined with 'all'"));
    }

    let outcomes = runner.install_all(cancel).await;
    let mut first_error: Option<CliError> = None;
    let mut summaries = Vec::new();
    for outcome in outcomes {
        summaries.push(match outcome.result {
            Ok(installed) => InstallSummary {
                tool: outcome.tool,
                version: Some(installed.version),
                path: Some(installed.executable_path.display().to_string()),
                checksum_verified: Some(installed.checksum_verified),
                error: None,
            },
            Err(e) => {
                let message = e.to_string();
                first_error.get_or_insert_with(|| CliError::from(e));
                InstallSummary {
                    tool: outcome.tool,
                    version: None,
                    path: None,
                    checksum_verified: None,
                    error: Some(message),
                }
            }
        });
    }

    let installed = summaries.iter().filter(|s| s.error.is_none()).count();
    if json {
        emit(true, &summaries, String::new)?;
    } else {
        for summary in &summaries {
            match (&summary.path, &summary.error) {
                (Some(path), _) => println!(
                    "  {} {} -> {}",
                    summary.tool,
                    summary.version.as_deref().unwrap_or_default(),
                    path
                ),
                (None, Some(error)) => println!("  {} failed: {error}", summary.tool),
                (None, None) => {}
            }
        }
        println!("Installed {installed} of {} tools", summaries.len());
    }

    match first_error {
        Some(err) if json => Ok(exit_code_for(&err)),
        Some(err) => Err(err),
        None => Ok(EXIT_OK),
    }
}

async fn uninstall(
    runner: &ToolRunner,
    tool: &str,
    version: Option<&str>,
    json: bool,
) -> Result<i32, CliError> {
    let tools: Vec<String> = if tool == ALL_TOOLS {
        if version.is_some() {
            return Err(CliError::config("--version cannot be combined with 'all'"));
        }
        let mut names: Vec<String> = runner
            .registry()
            .list()?
            .into_iter()
            .map(|entry| entry.tool)
            .collect();
        names.dedup();
        names
    } else {
        vec![tool.to_string()]
    };

    let mut removed = Vec::new();
    for name in &tools {
        removed.extend(runner.uninstall(name, version).await?);
    }

    emit(json, &removed, || {
        if removed.is_empty() {
            format!("Nothing to uninstall for {tool}")
        } else {
            removed
                .iter()
                .map(|entry| format!("Removed {} {}", entry.tool, entry.version))
                .collect::<Vec<_>>()
                .join("\n")
        }
    })
}

fn status(runner: &ToolRunner, json: bool) -> Result<i32, CliError> {
    let report = runner.status()?;
    emit(json, &report, || {
        let mut lines = Vec::new();
        lines.push(format!(
            "Platform: {}",
            report
                .platform
                .map_or_else(|| "unsupported".to_string(), |p| p.to_string())
        ));
        lines.push(format!("Platform supported: {}", report.platform_supported));
        lines.push(format!("Tools directory: {}", report.root.display()));
        lines.push(String::new());
        for tool in &report.tools {
            if tool.installed.is_empty() {
                lines.push(format!("  {}: not installed", tool.tool));
                continue;
            }
            for installed in &tool.installed {
                let state = if installed.valid { "installed" } else { "broken" };
                lines.push(format!(
                    "  {} {}: {state}\n    Path: {}",
                    tool.tool,
                    installed.version,
                    installed.path.display()
                ));
            }
        }
        lines.join("\n")
    })
}

#[derive(Serialize)]
struct ToolInfo {
    tool: String,
    latest: Option<String>,
    versions: Vec<VersionInfo>,
}

#[derive(Serialize)]
struct VersionInfo {
    version: String,
    platforms: Vec<PlatformKey>,
    installed: bool,
}

#[derive(Serialize)]
struct Info {
    version: &'static str,
    platform: Option<PlatformKey>,
    platform_supported: bool,
    tools_dir: String,
    tools: Vec<ToolInfo>,
}

fn info(runner: &ToolRunner, json: bool) -> Result<i32, CliError> {
    let status = runner.status()?;
    let catalog = runner.catalog();
    let mut tools = Vec::new();
    for tool in catalog.tools() {
        let installed = runner.registry().installed_versions(tool)?;
        let versions = catalog
            .versions(tool)?
            .into_iter()
            .map(|version| {
                Ok(VersionInfo {
                    platforms: catalog.platforms(tool, &version)?,
                    installed: installed.iter().any(|entry| entry.version == version),
                    version,
                })
            })
            .collect::<simplicity_core::Result<Vec<_>>>()?;
        tools.push(ToolInfo {
            tool: tool.to_string(),
            latest: catalog.resolve_version(tool, &VersionSpec::Latest).ok(),
            versions,
        });
    }

    let info = Info {
        version: env!("CARGO_PKG_VERSION"),
        platform: status.platform,
        platform_supported: status.platform_supported,
        tools_dir: status.root.display().to_string(),
        tools,
    };
    emit(json, &info, || {
        let mut lines = vec![
            format!("simplicity-tools {}", info.version),
            format!(
                "Platform: {}",
                info.platform
                    .map_or_else(|| "unsupported".to_string(), |p| p.to_string())
            ),
            format!("Platform supported: {}", info.platform_supported),
            format!("Tools directory: {}", info.tools_dir),
            String::new(),
            "Tools:".to_string(),
        ];
        for tool in &info.tools {
            lines.push(format!(
                "  {} (latest: {})",
                tool.tool,
                tool.latest.as_deref().unwrap_or("-")
            ));
            for version in &tool.versions {
                let platforms: Vec<String> =
                    version.platforms.iter().map(ToString::to_string).collect();
                let marker = if version.installed { " [installed]" } else { "" };
                lines.push(format!(
                    "    {}{marker}: {}",
                    version.version,
                    platforms.join(", ")
                ));
            }
        }
        lines.join("\n")
    })
}

fn versions(runner: &ToolRunner, tool: &str, json: bool) -> Result<i32, CliError> {
    let versions = runner.available_versions(tool)?;
    emit(json, &versions, || versions.join("\n"))
}

async fn run(
    runner: &ToolRunner,
    tool: &str,
    version: Option<&str>,
    args: &[String],
    options: RunOptions,
    print_json: bool,
) -> Result<i32, CliError> {
    let spec = VersionSpec::from(version);
    let capture = options.capture_output;
    let output = runner.run(tool, &spec, args, options).await?;
    if capture && print_json {
        let out = serde_json::to_string(&output)
            .map_err(|e| CliError::other(format!("Failed to serialize output: {e}")))?;
        println!("{out}");
    }
    Ok(output.exit_code)
}

fn link(runner: &ToolRunner, target: &Path, force: bool, json: bool) -> Result<i32, CliError> {
    let outcomes = runner.link_binaries(target, force)?;
    emit(json, &outcomes, || {
        if outcomes.is_empty() {
            return "No installed tools to link".to_string();
        }
        outcomes
            .iter()
            .map(|outcome| {
                let verb = match outcome.action {
                    LinkAction::Created => "linked",
                    LinkAction::Replaced => "replaced",
                    LinkAction::Unchanged => "unchanged",
                    LinkAction::Skipped => "skipped (exists, use --force)",
                };
                format!("{} {verb}: {}", outcome.tool, outcome.link.display())
            })
            .collect::<Vec<_>>()
            .join("\n")
    })
}
