//! Jobkeeper entry point.

use std::process::ExitCode;

use clap::Parser;
use log::error;

use jobkeeper::cli::{self, Cli};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli::execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}
