//! Bar aggregation trigger
//!
//! Folds written 1Min bars into coarser timeframes (`5Min`, `1H`, `1D`, ...).
//! Buckets are aligned to the UTC epoch; with the `nasdaq` filter only bars
//! inside the regular session contribute.

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use tracing::debug;

use super::{Trigger, TriggerConfig, TriggerError};
use crate::calendar::MarketCalendar;
use crate::metrics::TRIGGER_BARS_WRITTEN;
use crate::schema::{Bar, Row, TimeBucketKey, WriteEvent};

/// Named bucket width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeframe {
    name: String,
    seconds: i64,
}

impl Timeframe {
    /// Parse `5Min`, `15Min`, `1H`, `1D`, `30Sec`, `1W`
    pub fn parse(name: &str) -> Result<Self, TriggerError> {
        let invalid = || TriggerError::InvalidTimeframe(name.to_string());
        let digits = name.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
        let count: i64 = if digits == 0 {
            1
        } else {
            name[..digits].parse().map_err(|_| invalid())?
        };
        let unit = match &name[digits..] {
            "Sec" | "S" => 1,
            "Min" | "T" => 60,
            "H" => 3_600,
            "D" | "Day" => 86_400,
            "W" => 7 * 86_400,
            _ => return Err(invalid()),
        };
        if count <= 0 {
            return Err(invalid());
        }
        Ok(Self {
            name: name.to_string(),
            seconds: count * unit,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    fn bucket_start(&self, epoch: i64) -> i64 {
        epoch - epoch.rem_euclid(self.seconds)
    }
}

pub struct AggTrigger {
    destinations: Vec<Timeframe>,
    session: Option<MarketCalendar>,
}

impl AggTrigger {
    pub fn new(config: &TriggerConfig) -> Result<Self, TriggerError> {
        if config.destinations.is_empty() {
            return Err(TriggerError::NoDestinations);
        }
        let destinations = config
            .destinations
            .iter()
            .map(|d| Timeframe::parse(d))
            .collect::<Result<Vec<_>, _>>()?;
        let session = match config.filter.as_deref() {
            None | Some("") => None,
            Some(f) if f.eq_ignore_ascii_case("nasdaq") => Some(MarketCalendar::nasdaq()),
            Some(other) => return Err(TriggerError::UnknownFilter(other.to_string())),
        };
        Ok(Self {
            destinations,
            session,
        })
    }

    fn in_session(&self, bar: &Bar) -> bool {
        match (&self.session, Utc.timestamp_opt(bar.epoch, 0).single()) {
            (None, _) => true,
            (Some(calendar), Some(at)) => calendar.is_open(at),
            (Some(_), None) => false,
        }
    }

    fn aggregate(&self, timeframe: &Timeframe, bars: &[&Bar]) -> Vec<Bar> {
        let mut buckets: BTreeMap<i64, Bar> = BTreeMap::new();
        for bar in bars {
            let start = timeframe.bucket_start(bar.epoch);
            buckets
                .entry(start)
                .and_modify(|agg| agg.merge(bar))
                .or_insert_with(|| Bar {
                    epoch: start,
                    ..(*bar).clone()
                });
        }
        buckets.into_values().collect()
    }
}

impl Trigger for AggTrigger {
    fn name(&self) -> &str {
        "ondiskagg"
    }

    fn fire(&self, event: &WriteEvent) -> Vec<WriteEvent> {
        let mut bars: Vec<&Bar> = event.bars().filter(|b| self.in_session(b)).collect();
        if bars.is_empty() {
            return Vec::new();
        }
        bars.sort_by_key(|b| b.epoch);

        let symbol = event.key.symbol();
        self.destinations
            .iter()
            .map(|timeframe| {
                let rows: Vec<Row> = self
                    .aggregate(timeframe, &bars)
                    .into_iter()
                    .map(Row::Bar)
                    .collect();
                TRIGGER_BARS_WRITTEN.inc_by(rows.len() as u64);
                debug!(
                    symbol,
                    timeframe = timeframe.name(),
                    bars = rows.len(),
                    "Aggregated bars"
                );
                WriteEvent::new(TimeBucketKey::bars(symbol, timeframe.name()), rows)
            })
            .collect()
    }
}
