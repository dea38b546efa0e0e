//! Store Manager CLI
//!
//! - `start`: run a market store server
//! - `backfill`: bulk-load historical data

use anyhow::{anyhow, Result};
use clap::Parser;
use store_common::logging::{init_logging, LogConfig};

use store_manager::cli::{Cli, Commands};
use store_manager::metrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    init_logging(LogConfig::from_env().with_service("store-manager"))
        .map_err(|e| anyhow!("Failed to initialize logging: {}", e))?;
    metrics::register_metrics()?;

    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => {
            store_manager::cli::start::execute(args).await?;
        }
        Commands::Backfill(args) => {
            store_manager::cli::backfill::execute(args).await?;
        }
    }

    Ok(())
}
