//! Dispatch loop
//!
//! Units are dispatched in enumeration order. Each one waits for an admission
//! token, runs on the runtime and releases the token on completion. The batch
//! ends with a drain of the admission pool.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use store_common::error::ErrorClassification;
use tracing::{debug, error, info, warn};

use super::{DataKind, TaskPool, WorkUnit};
use crate::metrics::{API_CALL_DURATION, BACKFILL_UNITS_DISPATCHED, BACKFILL_UNITS_FAILED};
use crate::provider::{DataSource, ProviderResult};

pub const DEFAULT_BATCH_SIZE: usize = 50_000;
pub const DEFAULT_SETTLE_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Admission pool capacity
    pub parallelism: usize,
    /// Page size for quote and trade downloads
    pub batch_size: usize,
    /// Pause after the batch so aggregation triggers can finish
    pub settle_wait: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            batch_size: DEFAULT_BATCH_SIZE,
            settle_wait: DEFAULT_SETTLE_WAIT,
        }
    }
}

pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Outcome of one batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rows: usize,
    /// Wall time from first dispatch to drain
    pub elapsed: Duration,
    /// Cumulative time spent inside data source calls
    pub api_call_duration: Duration,
}

#[derive(Default)]
struct Tally {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    rows: AtomicUsize,
    api_nanos: AtomicU64,
}

pub struct BackfillScheduler {
    source: Arc<dyn DataSource>,
    config: SchedulerConfig,
}

impl BackfillScheduler {
    pub fn new(source: Arc<dyn DataSource>, config: SchedulerConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Run every unit and wait for all of them. Failures are logged and
    /// counted; they never stop the batch.
    pub async fn run(&self, units: Vec<WorkUnit>) -> BackfillReport {
        let pool = TaskPool::new(self.config.parallelism);
        let tally = Arc::new(Tally::default());
        let started = Instant::now();
        let mut dispatched = 0;

        info!(
            units = units.len(),
            parallelism = pool.admission().capacity(),
            source = self.source.name(),
            "Starting backfill"
        );

        for unit in units {
            let source = Arc::clone(&self.source);
            let tally = Arc::clone(&tally);
            let batch_size = self.config.batch_size;

            let task = async move {
                let outcome = AssertUnwindSafe(execute(&*source, &unit, batch_size, &tally))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(rows)) => {
                        tally.succeeded.fetch_add(1, Ordering::Relaxed);
                        tally.rows.fetch_add(rows, Ordering::Relaxed);
                        debug!(unit = %unit, rows, "Unit complete");
                    }
                    Ok(Err(e)) => {
                        tally.failed.fetch_add(1, Ordering::Relaxed);
                        BACKFILL_UNITS_FAILED.inc();
                        warn!(
                            symbol = %unit.symbol,
                            kind = %unit.kind,
                            start = %unit.start,
                            end = %unit.end,
                            transient = e.is_transient(),
                            error = %e,
                            "Failed to backfill"
                        );
                    }
                    Err(panic) => {
                        tally.failed.fetch_add(1, Ordering::Relaxed);
                        BACKFILL_UNITS_FAILED.inc();
                        error!(
                            symbol = %unit.symbol,
                            kind = %unit.kind,
                            start = %unit.start,
                            end = %unit.end,
                            panic = %panic_message(&*panic),
                            "Backfill unit panicked"
                        );
                    }
                }
            };

            if let Err(e) = pool.submit(task).await {
                error!(error = %e, "Admission pool closed, stopping dispatch");
                break;
            }
            dispatched += 1;
            BACKFILL_UNITS_DISPATCHED.inc();
        }

        if let Err(e) = pool.wait_all().await {
            error!(error = %e, "Admission pool closed while draining");
        }

        let report = BackfillReport {
            dispatched,
            succeeded: tally.succeeded.load(Ordering::Relaxed),
            failed: tally.failed.load(Ordering::Relaxed),
            rows: tally.rows.load(Ordering::Relaxed),
            elapsed: started.elapsed(),
            api_call_duration: Duration::from_nanos(tally.api_nanos.load(Ordering::Relaxed)),
        };
        info!(api_call_duration = ?report.api_call_duration, "API call duration");
        info!(
            elapsed = ?report.elapsed,
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            failed = report.failed,
            rows = report.rows,
            "Backfilling complete"
        );

        if !self.config.settle_wait.is_zero() {
            info!(
                wait = ?self.config.settle_wait,
                "Waiting for aggregation triggers to complete"
            );
            tokio::time::sleep(self.config.settle_wait).await;
        }
        report
    }
}

/// Route a unit to the matching data source call and time it
async fn execute(
    source: &dyn DataSource,
    unit: &WorkUnit,
    batch_size: usize,
    tally: &Tally,
) -> ProviderResult<usize> {
    let call_started = Instant::now();
    let result = match (unit.kind, unit.exchanges.as_deref()) {
        (DataKind::Bars, None) => source.bars(&unit.symbol, unit.start, unit.end).await,
        (DataKind::Bars, Some(exchanges)) => {
            source
                .bars_from_trades(&unit.symbol, unit.start, exchanges, batch_size)
                .await
        }
        (DataKind::Quotes, _) => {
            source
                .quotes(&unit.symbol, unit.start, unit.end, batch_size)
                .await
        }
        (DataKind::Trades, _) => source.trades(&unit.symbol, unit.start, batch_size).await,
    };
    let spent = call_started.elapsed();
    API_CALL_DURATION.observe(spent.as_secs_f64());
    tally
        .api_nanos
        .fetch_add(spent.as_nanos() as u64, Ordering::Relaxed);
    result
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
