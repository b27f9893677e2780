//! dockwatch - SSH-driven Docker fleet orchestration
//!
//! This is the main entry point for the `dw` binary.

use anyhow::Result;
use clap::Parser;
use dw_cli::Cli;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config when it loads; errors surface later
    let (level, json) = cli
        .load_config()
        .map(|c| (c.global.log_level, c.global.json_logs))
        .unwrap_or_else(|_| ("info".to_string(), false));

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }

    cli.run().await?;

    Ok(())
}
