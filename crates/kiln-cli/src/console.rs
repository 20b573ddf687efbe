//! Process entry points.

use clap::Parser;
use kiln_executor::CommandRegistry;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use crate::{Cli, commands, exit_code};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Run a parsed command line, printing any error.
pub async fn run_cli(cli: Cli, registry: CommandRegistry) -> ExitCode {
    match commands::run(cli, registry).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

/// Entry point for a binary that registers its own commands.
///
/// Parses the process arguments, installs logging (`RUST_LOG`, default
/// `info`) and runs the requested command with `registry`.
pub async fn main_with_registry(registry: CommandRegistry) -> ExitCode {
    init_tracing();
    run_cli(Cli::parse(), registry).await
}
