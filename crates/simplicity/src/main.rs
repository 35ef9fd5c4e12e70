//! `simplicity-tools` binary.

// The binary is the one place allowed to write to the terminal.
#![allow(clippy::print_stdout, clippy::print_stderr)]

use simplicity_tools::cli::{self, CliError, EXIT_CANCELLED, exit_code_for, render_error};
use simplicity_tools::commands;
use simplicity_tools::tracing::{TracingConfig, TracingFormat, init_tracing};
use tokio_util::sync::CancellationToken;

fn main() {
    // Tracing may be unusable during a panic.
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("simplicity-tools panicked: {panic_info}");
        eprintln!("Internal error occurred. Run with RUST_LOG=debug for more information.");
    }));

    let cli = cli::parse();
    let json = cli.json;

    let format = if json && cli.log_format == TracingFormat::Compact {
        TracingFormat::Json
    } else {
        cli.log_format
    };
    if let Err(e) = init_tracing(TracingConfig {
        format,
        level: cli.level.into(),
        filter: None,
    }) {
        eprintln!("Warning: {e}");
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Fatal error: Failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(run(cli, json));
    // Don't wait on blocking lock waits that were abandoned by a cancellation.
    runtime.shutdown_background();
    std::process::exit(code);
}

async fn run(cli: cli::Cli, json: bool) -> i32 {
    let cancel = CancellationToken::new();
    let work = commands::execute(cli, cancel.clone());
    tokio::pin!(work);

    // The first Ctrl-C cancels the in-flight operation and lets it clean up;
    // a second one exits immediately.
    let result = tokio::select! {
        biased;

        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling");
            cancel.cancel();
            tokio::select! {
                biased;

                _ = tokio::signal::ctrl_c() => return EXIT_CANCELLED,
                result = &mut work => result,
            }
        }
        result = &mut work => result,
    };

    match result {
        Ok(code) => code,
        Err(err) => finish_with_error(&err, json),
    }
}

fn finish_with_error(err: &CliError, json: bool) -> i32 {
    render_error(err, json);
    exit_code_for(err)
}
