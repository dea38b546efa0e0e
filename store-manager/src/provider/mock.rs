//! In-memory data source for tests
//!
//! Records every call, tracks peak concurrency and can be told to fail or
//! panic for particular (symbol, day) pairs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use super::{DataSource, ProviderError, ProviderResult};
use crate::schema::{Bar, Row, TimeBucketKey, WriteEvent, MINUTE_TIMEFRAME};
use crate::storage::StorageEngine;

/// One recorded data source call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub method: &'static str,
    pub symbol: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MockDataSource {
    tickers: Vec<String>,
    delay: Duration,
    fail_on: HashSet<(String, NaiveDate)>,
    panic_on: HashSet<(String, NaiveDate)>,
    storage: Option<Arc<dyn StorageEngine>>,
    calls: Mutex<Vec<MockCall>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl MockDataSource {
    pub fn new<I, S>(tickers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tickers: tickers.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Sleep this long inside every ingestion call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_on(mut self, symbol: &str, day: NaiveDate) -> Self {
        self.fail_on.insert((symbol.to_string(), day));
        self
    }

    pub fn panic_on(mut self, symbol: &str, day: NaiveDate) -> Self {
        self.panic_on.insert((symbol.to_string(), day));
        self
    }

    /// Write one placeholder bar per call into `storage`
    pub fn with_storage(mut self, storage: Arc<dyn StorageEngine>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn ingest(
        &self,
        method: &'static str,
        symbol: &str,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> ProviderResult<usize> {
        self.calls.lock().push(MockCall {
            method,
            symbol: symbol.to_string(),
            start,
            end,
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let key = (symbol.to_string(), start.date_naive());
        if self.panic_on.contains(&key) {
            panic!("mock data source panicked for {} on {}", key.0, key.1);
        }
        if self.fail_on.contains(&key) {
            return Err(ProviderError::NoData(format!(
                "{} on {}",
                key.0, key.1
            )));
        }

        if let Some(storage) = &self.storage {
            let bar = Bar {
                epoch: start.timestamp(),
                open: Decimal::ONE,
                high: Decimal::ONE,
                low: Decimal::ONE,
                close: Decimal::ONE,
                volume: Decimal::ONE,
            };
            storage
                .write(WriteEvent::new(
                    TimeBucketKey::bars(symbol, MINUTE_TIMEFRAME),
                    vec![Row::Bar(bar)],
                ))
                .await?;
        }
        Ok(1)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataSource for MockDataSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_tickers(&self) -> ProviderResult<Vec<String>> {
        Ok(self.tickers.clone())
    }

    async fn bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ProviderResult<usize> {
        self.ingest("bars", symbol, start, Some(end)).await
    }

    async fn bars_from_trades(
        &self,
        symbol: &str,
        day: DateTime<Utc>,
        _exchanges: &[i32],
        _batch_size: usize,
    ) -> ProviderResult<usize> {
        self.ingest("bars_from_trades", symbol, day, None).await
    }

    async fn quotes(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _batch_size: usize,
    ) -> ProviderResult<usize> {
        self.ingest("quotes", symbol, start, Some(end)).await
    }

    async fn trades(
        &self,
        symbol: &str,
        day: DateTime<Utc>,
        _batch_size: usize,
    ) -> ProviderResult<usize> {
        self.ingest("trades", symbol, day, None).await
    }
}
