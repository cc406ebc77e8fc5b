use hone_core::{logging, shim};
use std::process::ExitCode;
use tracing::error;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = logging::init(None) {
        eprintln!("Failed to initialize logging: {err}");
        return ExitCode::FAILURE;
    }

    let argv: Vec<String> = std::env::args().skip(1).collect();
    match shim::run(argv).await {
        Ok(code) => ExitCode::from(code.clamp(0, u8::MAX as i32) as u8),
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}
