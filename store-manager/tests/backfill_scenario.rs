//! Backfill Scenario Tests
//!
//! End-to-end batches against the mock data source writing into a local
//! store: enumeration over a calendar, bounded dispatch, failure isolation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Datelike, NaiveDate, Weekday};
use store_manager::backfill::{
    compile_pattern, select_symbols, BackfillPlan, BackfillScheduler, DataKind, KindSelection,
    SchedulerConfig,
};
use store_manager::calendar::MarketCalendar;
use store_manager::provider::mock::MockDataSource;
use store_manager::schema::{TimeBucketKey, MINUTE_TIMEFRAME};
use store_manager::storage::{InstanceSetup, LocalStore, StorageEngine};
use tempfile::TempDir;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn bars_only() -> KindSelection {
    KindSelection {
        bars: true,
        quotes: false,
        trades: false,
    }
}

fn config(parallelism: usize) -> SchedulerConfig {
    SchedulerConfig {
        parallelism,
        batch_size: 1_000,
        settle_wait: Duration::ZERO,
    }
}

async fn store(dir: &TempDir) -> Arc<dyn StorageEngine> {
    Arc::new(LocalStore::initialize(InstanceSetup::new(dir.path())).await.unwrap())
}

/// Fri 2024-01-05 .. Wed 2024-01-10: five days, Sat and Sun closed
#[tokio::test]
async fn test_three_symbols_three_market_days() {
    let dir = TempDir::new().unwrap();
    let storage = store(&dir).await;
    let source = Arc::new(
        MockDataSource::new(["AAA", "BBB", "CCC", "ZZZ1"]).with_storage(Arc::clone(&storage)),
    );

    let pattern = compile_pattern("[A-C]*").unwrap();
    let symbols = select_symbols(source.as_ref(), &pattern).await.unwrap();
    assert_eq!(symbols, vec!["AAA", "BBB", "CCC"]);

    let plan = BackfillPlan::new(symbols, date(2024, 1, 5), date(2024, 1, 10), bars_only()).unwrap();
    let units = plan.enumerate(&MarketCalendar::nasdaq());
    assert_eq!(units.len(), 9);
    assert!(units.iter().all(|unit| unit.kind == DataKind::Bars));
    assert!(units
        .iter()
        .all(|unit| !matches!(unit.day().weekday(), Weekday::Sat | Weekday::Sun)));

    let report = BackfillScheduler::new(source.clone(), config(2)).run(units).await;
    assert_eq!(report.dispatched, 9);
    assert_eq!(report.succeeded, 9);
    assert_eq!(report.failed, 0);
    assert_eq!(report.rows, 9);
    assert!(source.peak_in_flight() <= 2);

    for symbol in ["AAA", "BBB", "CCC"] {
        let rows = storage
            .query(&TimeBucketKey::bars(symbol, MINUTE_TIMEFRAME), 100)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3, "rows for {}", symbol);
    }
}

#[tokio::test]
async fn test_failures_do_not_stop_the_batch() {
    let source = Arc::new(
        MockDataSource::new(["AAA", "BBB"])
            .fail_on("AAA", date(2024, 1, 8))
            .panic_on("BBB", date(2024, 1, 9)),
    );
    let plan = BackfillPlan::new(
        vec!["AAA".into(), "BBB".into()],
        date(2024, 1, 8),
        date(2024, 1, 11),
        KindSelection {
            bars: false,
            quotes: true,
            trades: true,
        },
    )
    .unwrap();
    let units = plan.enumerate(&MarketCalendar::nasdaq());
    assert_eq!(units.len(), 12);

    let report = BackfillScheduler::new(source.clone(), config(3)).run(units).await;
    assert_eq!(report.dispatched, 12);
    // One failing and one panicking (symbol, day) pair, each hit by quotes and trades
    assert_eq!(report.failed, 4);
    assert_eq!(report.succeeded, 8);
    assert_eq!(source.calls().len(), 12);
}

#[tokio::test]
async fn test_run_returns_only_after_slow_units_finish() {
    let delay = Duration::from_millis(50);
    let source = Arc::new(MockDataSource::new(["AAA"]).with_delay(delay));
    let plan = BackfillPlan::new(
        vec!["AAA".into()],
        date(2024, 1, 8),
        date(2024, 1, 13),
        KindSelection {
            bars: false,
            quotes: false,
            trades: true,
        },
    )
    .unwrap();
    let units = plan.enumerate(&MarketCalendar::nasdaq());
    assert_eq!(units.len(), 5);

    let started = Instant::now();
    let report = BackfillScheduler::new(source.clone(), config(2)).run(units).await;
    // Five units, two at a time: three waves
    assert!(started.elapsed() >= delay * 3);
    assert_eq!(report.succeeded, 5);
    assert_eq!(source.peak_in_flight(), 2);
}

#[tokio::test]
async fn test_rerun_enumerates_identical_units() {
    let plan = BackfillPlan::new(
        vec!["AAA".into(), "BBB".into()],
        date(2024, 6, 1),
        date(2024, 9, 1),
        KindSelection {
            bars: true,
            quotes: true,
            trades: true,
        },
    )
    .unwrap()
    .with_bar_period(Duration::from_secs(7 * 24 * 3600));
    let calendar = MarketCalendar::nasdaq();

    let mut first = plan.enumerate(&calendar);
    let mut second = plan.clone().enumerate(&calendar);
    first.sort_by_key(|unit| unit.to_string());
    second.sort_by_key(|unit| unit.to_string());
    assert_eq!(first, second);
}
