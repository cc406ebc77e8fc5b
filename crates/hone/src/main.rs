use clap::Parser;
use hone_core::logging::{self, LogBuffer};
use hone_core::{config, orchestrator};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tracing::error;

mod cli;

#[tokio::main]
async fn main() -> ExitCode {
    let log_buffer: LogBuffer = Arc::new(Mutex::new(Vec::new()));
    if let Err(err) = logging::init(Some(log_buffer.clone())) {
        eprintln!("Failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    let parsed = cli::Cli::parse();
    let (config_path, target) = parsed.config_and_target();

    let config = match config::load(&config_path).await {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = orchestrator::run_build(config, &target, Some(log_buffer)).await;
    for err in &outcome.errors {
        error!("{err}");
    }

    // The exit code is the number of errors, saturated into range.
    ExitCode::from(outcome.errors.len().min(u8::MAX as usize) as u8)
}
