//! Command-line interface
//!
//! - `start`: run the store server until a termination signal
//! - `backfill`: bulk-load historical data from Polygon and exit

pub mod backfill;
pub mod start;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "store-manager")]
#[command(about = "Market store server and historical backfill")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a market store server
    #[command(alias = "s")]
    Start(start::StartArgs),
    /// Backfill bars, quotes and trades from Polygon
    Backfill(backfill::BackfillArgs),
}
