//! Row types written into the store
//!
//! The store keys every series by a `SYMBOL/TIMEFRAME/RECORDTYPE` bucket key
//! (e.g. `AAPL/1Min/OHLCV`). Rows are the unit of replication and of the
//! streaming endpoint.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Bar timeframe written by the backfill job
pub const MINUTE_TIMEFRAME: &str = "1Min";

/// Series identifier: `SYMBOL/TIMEFRAME/RECORDTYPE`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeBucketKey(String);

impl TimeBucketKey {
    /// Build a key from its three parts
    pub fn new(symbol: &str, timeframe: &str, record_type: &str) -> Self {
        Self(format!("{}/{}/{}", symbol, timeframe, record_type))
    }

    /// OHLCV bars for `symbol` at `timeframe`
    pub fn bars(symbol: &str, timeframe: &str) -> Self {
        Self::new(symbol, timeframe, "OHLCV")
    }

    pub fn quotes(symbol: &str) -> Self {
        Self::new(symbol, "1Sec", "QUOTE")
    }

    pub fn trades(symbol: &str) -> Self {
        Self::new(symbol, "1Sec", "TRADE")
    }

    /// Parse a raw key. Each of the three parts must be usable as a single
    /// path component under the storage root.
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split('/').collect();
        if parts.len() == 3 && parts.iter().all(|p| is_plain_component(p)) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn symbol(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    pub fn timeframe(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or_default()
    }
}

fn is_plain_component(part: &str) -> bool {
    !part.is_empty()
        && part != "."
        && part != ".."
        && !part.contains(|c: char| c == '\\' || c == ':' || c.is_control())
}

impl TryFrom<String> for TimeBucketKey {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("invalid bucket key '{}'", raw))
    }
}

impl From<TimeBucketKey> for String {
    fn from(key: TimeBucketKey) -> Self {
        key.0
    }
}

impl fmt::Display for TimeBucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// OHLCV bar, `epoch` in seconds at the bar open
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub epoch: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    /// Fold another bar that follows this one in time into it
    pub fn merge(&mut self, next: &Bar) {
        self.high = self.high.max(next.high);
        self.low = self.low.min(next.low);
        self.close = next.close;
        self.volume += next.volume;
    }
}

/// Top-of-book quote, `epoch_ns` in nanoseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub epoch_ns: i64,
    pub bid_price: Decimal,
    pub bid_size: Decimal,
    pub ask_price: Decimal,
    pub ask_size: Decimal,
}

/// Trade print, `epoch_ns` in nanoseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub epoch_ns: i64,
    pub price: Decimal,
    pub size: Decimal,
    pub exchange: i32,
    #[serde(default)]
    pub conditions: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Row {
    Bar(Bar),
    Quote(Quote),
    Trade(Trade),
}

/// A batch of rows written under one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteEvent {
    pub key: TimeBucketKey,
    pub rows: Vec<Row>,
}

impl WriteEvent {
    pub fn new(key: TimeBucketKey, rows: Vec<Row>) -> Self {
        Self { key, rows }
    }

    /// Bars contained in this event, in row order
    pub fn bars(&self) -> impl Iterator<Item = &Bar> {
        self.rows.iter().filter_map(|row| match row {
            Row::Bar(bar) => Some(bar),
            _ => None,
        })
    }
}
