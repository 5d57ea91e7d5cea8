//! vpnmupd entry point.
//!
//! Parses arguments, runs the selected mode and renders failures with
//! context and a suggestion before exiting with status 1.

use anyhow::Result;
use clap::Parser;
use vpnmupd::cli;
use vpnmupd::core::error::user_friendly_error;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    match cli.execute().await {
        Ok(()) => Ok(()),
        Err(e) => {
            let error_ctx = user_friendly_error(e);
            error_ctx.display();
            std::process::exit(1);
        }
    }
}
