use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use crate::config::DEFAULT_CONFIG_PATH;
use crate::lifecycle::LifecycleManager;

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Path of the YAML configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}

/// Blocks until a termination signal has been fully handled
pub async fn execute(args: StartArgs) -> Result<()> {
    info!(config = %args.config.display(), "Using configuration");
    LifecycleManager::new(&args.config)
        .run()
        .await
        .context("Failed to start market store server")?;
    Ok(())
}
