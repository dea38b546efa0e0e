//! `backfill` command
//!
//! Lists the source's tickers, selects those matching `--symbols`, plans one
//! unit per symbol, kind and window, and runs them with bounded parallelism
//! against a store opened at `<dir>/mktsdb`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use clap::Args;
use tracing::{info, warn};

use crate::backfill::{
    compile_pattern, default_parallelism, effective_bar_period, parse_date, parse_exchanges,
    parse_period, select_symbols, BackfillError, BackfillPlan, BackfillResult, BackfillScheduler,
    KindSelection, SchedulerConfig, DEFAULT_BATCH_SIZE, MIN_BAR_PERIOD,
};
use crate::calendar::MarketCalendar;
use crate::config::duration::{format_duration, parse_duration};
use crate::provider::{PolygonClient, PolygonConfig};
use crate::storage::{InstanceSetup, LocalStore, StorageEngine};
use crate::trigger::{AggTrigger, TriggerConfig, TriggerMatcher};

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Args, Debug, Clone)]
pub struct BackfillArgs {
    /// Store directory; data is written to `<dir>/mktsdb`
    #[arg(long, default_value = "/project/data")]
    pub dir: PathBuf,

    /// First day to backfill (YYYY-MM-DD), included. Defaults to a year ago
    #[arg(long)]
    pub from: Option<String>,

    /// Day to stop at (YYYY-MM-DD), not included. Defaults to today
    #[arg(long)]
    pub to: Option<String>,

    /// Comma separated exchange IDs, `*` for all
    #[arg(long, default_value = "*")]
    pub exchanges: String,

    #[arg(long)]
    pub bars: bool,

    /// Window per bar request, clamped to [24h, 1440h]
    #[arg(long, default_value = "24h")]
    pub bar_period: String,

    #[arg(long)]
    pub quotes: bool,

    #[arg(long)]
    pub trades: bool,

    /// Glob of symbols to backfill, `*` for all
    #[arg(long, default_value = "*")]
    pub symbols: String,

    /// Concurrent units, defaults to the number of CPUs
    #[arg(long)]
    pub parallelism: Option<usize>,

    /// Page size for quote and trade downloads
    #[arg(long, alias = "batchSize", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    #[arg(long, alias = "apiKey", env = "POLYGON_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Wait after the batch for aggregation triggers
    #[arg(long, default_value = "10s")]
    pub settle_wait: String,
}

impl BackfillArgs {
    /// `[from, to)` with defaults relative to `today`
    pub fn date_range(&self, today: NaiveDate) -> BackfillResult<(NaiveDate, NaiveDate)> {
        let from = match &self.from {
            Some(value) => parse_date(value)?,
            None => today - ChronoDuration::days(365),
        };
        let to = match &self.to {
            Some(value) => parse_date(value)?,
            None => today,
        };
        Ok((from, to))
    }

    pub fn kinds(&self) -> KindSelection {
        KindSelection {
            bars: self.bars,
            quotes: self.quotes,
            trades: self.trades,
        }
    }

    pub fn scheduler_config(&self) -> BackfillResult<SchedulerConfig> {
        let settle_wait = parse_duration(&self.settle_wait)
            .ok_or_else(|| BackfillError::InvalidDuration(self.settle_wait.clone()))?;
        Ok(SchedulerConfig {
            parallelism: self.parallelism.unwrap_or_else(default_parallelism).max(1),
            batch_size: self.batch_size.max(1),
            settle_wait,
        })
    }
}

pub async fn execute(args: BackfillArgs) -> Result<()> {
    let api_key = args
        .api_key
        .clone()
        .filter(|key| !key.is_empty())
        .ok_or(BackfillError::MissingApiKey)?;

    let today = Utc::now().date_naive();
    let (from, to) = args.date_range(today)?;
    let bar_period = parse_period(&args.bar_period)?;
    let exchanges = parse_exchanges(&args.exchanges)?;
    let pattern = compile_pattern(&args.symbols)?;
    let config = args.scheduler_config()?;

    let kinds = args.kinds();
    if kinds.is_empty() {
        warn!("Nothing to backfill, pass --bars, --quotes or --trades");
        return Ok(());
    }
    if exchanges.is_some() && effective_bar_period(bar_period, false) != MIN_BAR_PERIOD {
        warn!(
            bar_period = %format_duration(bar_period),
            "Bar period not adjustable when exchange filtered, using 24h"
        );
    }

    let storage = open_writer(&args.dir).await?;
    let client = PolygonClient::new(PolygonConfig::new(api_key), Arc::clone(&storage))?;

    let symbols = select_symbols(&client, &pattern).await?;
    let plan = BackfillPlan::new(symbols, from, to, kinds)?
        .with_bar_period(bar_period)
        .with_exchanges(exchanges);
    info!(
        from = %from.format(DATE_FORMAT),
        to = %to.format(DATE_FORMAT),
        symbols = plan.symbols.len(),
        bars = kinds.bars,
        quotes = kinds.quotes,
        trades = kinds.trades,
        "Backfill plan"
    );
    let units = plan.enumerate(&MarketCalendar::nasdaq());

    let report = BackfillScheduler::new(Arc::new(client), config).run(units).await;
    if report.failed > 0 {
        warn!(
            failed = report.failed,
            dispatched = report.dispatched,
            "Some units failed, see the log above for details"
        );
    }
    Ok(())
}

/// Open the store the backfill writes into, with 1Min bars aggregated into
/// the higher timeframes during market hours
async fn open_writer(dir: &Path) -> BackfillResult<Arc<dyn StorageEngine>> {
    let setup = InstanceSetup {
        wal_bypass: true,
        ..InstanceSetup::new(dir.join("mktsdb"))
    };
    let store = LocalStore::initialize(setup).await?;

    let trigger = AggTrigger::new(&TriggerConfig {
        filter: Some("nasdaq".to_string()),
        destinations: ["5Min", "15Min", "1H", "1D"].map(String::from).to_vec(),
    })?;
    let matcher = TriggerMatcher::new(Arc::new(trigger), "*/1Min/OHLCV")?;
    store.register_trigger(matcher);

    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Commands};
    use clap::Parser;
    use std::time::Duration;

    fn parse(args: &[&str]) -> BackfillArgs {
        let mut argv = vec!["store-manager", "backfill"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Commands::Backfill(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["--bars"]);
        assert_eq!(args.dir, PathBuf::from("/project/data"));
        assert_eq!(args.symbols, "*");
        assert_eq!(args.exchanges, "*");
        assert_eq!(args.bar_period, "24h");
        assert_eq!(args.batch_size, 50_000);
        assert!(args.kinds().bars && !args.kinds().quotes);

        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let (from, to) = args.date_range(today).unwrap();
        assert_eq!(to, today);
        assert_eq!(from, NaiveDate::from_ymd_opt(2023, 3, 2).unwrap());

        let config = args.scheduler_config().unwrap();
        assert!(config.parallelism >= 1);
        assert_eq!(config.settle_wait, Duration::from_secs(10));
    }

    #[test]
    fn test_explicit_flags() {
        let args = parse(&[
            "--from",
            "2024-01-02",
            "--to",
            "2024-01-05",
            "--trades",
            "--parallelism",
            "4",
            "--batch-size",
            "100",
            "--symbols",
            "A*",
            "--settle-wait",
            "0s",
        ]);
        let (from, to) = args.date_range(NaiveDate::MIN).unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 1, 5).unwrap());
        let config = args.scheduler_config().unwrap();
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.settle_wait, Duration::ZERO);
    }

    #[test]
    fn test_bad_date_is_rejected() {
        let args = parse(&["--from", "01/02/2024"]);
        assert!(matches!(
            args.date_range(NaiveDate::MIN),
            Err(BackfillError::InvalidDate { .. })
        ));
    }

    #[tokio::test]
    async fn test_writer_layout() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = open_writer(dir.path()).await.unwrap();
        assert!(storage.catalog().is_empty());
        assert!(dir.path().join("mktsdb").is_dir());
    }
}
