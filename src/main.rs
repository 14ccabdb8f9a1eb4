//! agentloop - autonomy runtime and task queue for coding agent CLIs.

use agentloop::{logging, Commands};
use clap::Parser;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Commands::parse();

    let paths = match args.paths() {
        Ok(paths) => paths,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Held until exit so buffered log lines are flushed.
    let _guard = match logging::init(&paths) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match args.run(&paths).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(&e);
            ExitCode::FAILURE
        }
    }
}

/// One line on stderr; the full record goes to the log file only.
fn report_failure(e: &anyhow::Error) {
    tracing::debug!("Command failed: {}", e);
    eprintln!("Error: {}", e);
}
