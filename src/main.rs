//! agentmux - multi-agent message routing and orchestration core.

use clap::Parser;
use std::process::ExitCode;

use agentmux::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    if let Err(e) = agentmux::logging::init() {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    // Parse command line arguments
    let args = Commands::parse();

    // Run the command
    match args.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
