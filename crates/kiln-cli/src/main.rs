//! kiln command-line tool.

use kiln_executor::builtin_registry;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    kiln_cli::main_with_registry(builtin_registry()).await
}
