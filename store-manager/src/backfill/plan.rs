//! Work unit enumeration
//!
//! Turns (symbols, date range, kind selection, bar period, exchange filter)
//! into the full list of work units. Enumeration is pure: the same inputs and
//! calendar always produce the same units in the same order.

use std::fmt;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;

use super::{BackfillError, BackfillResult};
use crate::calendar::TradingCalendar;
use crate::config::duration::parse_duration;

pub const MIN_BAR_PERIOD: StdDuration = StdDuration::from_secs(24 * 3600);
pub const MAX_BAR_PERIOD: StdDuration = StdDuration::from_secs(60 * 24 * 3600);

/// Kind of market data a unit ingests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Bars,
    Quotes,
    Trades,
}

impl DataKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Bars => "bars",
            DataKind::Quotes => "quotes",
            DataKind::Trades => "trades",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which kinds to backfill; each is enabled independently
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindSelection {
    pub bars: bool,
    pub quotes: bool,
    pub trades: bool,
}

impl KindSelection {
    pub fn is_empty(&self) -> bool {
        !(self.bars || self.quotes || self.trades)
    }
}

/// One independently executable ingestion task over `[start, end)`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkUnit {
    pub symbol: String,
    pub kind: DataKind,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub exchanges: Option<Vec<i32>>,
}

impl WorkUnit {
    /// Calendar day the unit starts on
    pub fn day(&self) -> NaiveDate {
        self.start.date_naive()
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}, {})",
            self.symbol,
            self.kind,
            self.start.format("%Y-%m-%d %H:%M"),
            self.end.format("%Y-%m-%d %H:%M")
        )
    }
}

/// Validated inputs of a backfill batch
#[derive(Debug, Clone)]
pub struct BackfillPlan {
    pub symbols: Vec<String>,
    /// Inclusive
    pub from: NaiveDate,
    /// Exclusive
    pub to: NaiveDate,
    pub kinds: KindSelection,
    /// Configured period, clamped at enumeration time
    pub bar_period: StdDuration,
    pub exchanges: Option<Vec<i32>>,
}

impl BackfillPlan {
    pub fn new(
        symbols: Vec<String>,
        from: NaiveDate,
        to: NaiveDate,
        kinds: KindSelection,
    ) -> BackfillResult<Self> {
        if from >= to {
            return Err(BackfillError::InvalidRange {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(Self {
            symbols,
            from,
            to,
            kinds,
            bar_period: MIN_BAR_PERIOD,
            exchanges: None,
        })
    }

    pub fn with_bar_period(mut self, period: StdDuration) -> Self {
        self.bar_period = period;
        self
    }

    pub fn with_exchanges(mut self, exchanges: Option<Vec<i32>>) -> Self {
        self.exchanges = exchanges.filter(|ids| !ids.is_empty());
        self
    }

    fn range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (start_of_day(self.from), start_of_day(self.to))
    }

    /// Enumerate every unit, symbols outer and time inner, bars before
    /// quotes before trades.
    pub fn enumerate(&self, calendar: &dyn TradingCalendar) -> Vec<WorkUnit> {
        let mut units = Vec::new();
        if self.kinds.bars {
            for symbol in &self.symbols {
                units.extend(self.bar_units(symbol, calendar));
            }
        }
        if self.kinds.quotes {
            for symbol in &self.symbols {
                units.extend(self.daily_units(symbol, DataKind::Quotes, calendar));
            }
        }
        if self.kinds.trades {
            for symbol in &self.symbols {
                units.extend(self.daily_units(symbol, DataKind::Trades, calendar));
            }
        }
        units
    }

    fn bar_units(&self, symbol: &str, calendar: &dyn TradingCalendar) -> Vec<WorkUnit> {
        let period = Duration::from_std(effective_bar_period(
            self.bar_period,
            self.exchanges.is_some(),
        ))
        .unwrap_or_else(|_| Duration::days(1));
        let (start, end) = self.range();

        let mut units = Vec::new();
        let mut chunk_start = start;
        while chunk_start < end {
            let chunk_end = (chunk_start + period).min(end);
            // A chunk that opens on a weekend still covers the market days after it
            let first_market_day = days_between(chunk_start, chunk_end)
                .find(|day| calendar.is_market_day(day.date_naive()));
            if let Some(unit_start) = first_market_day {
                units.push(WorkUnit {
                    symbol: symbol.to_string(),
                    kind: DataKind::Bars,
                    start: unit_start,
                    end: chunk_end,
                    exchanges: self.exchanges.clone(),
                });
            }
            chunk_start = chunk_end;
        }
        units
    }

    fn daily_units(
        &self,
        symbol: &str,
        kind: DataKind,
        calendar: &dyn TradingCalendar,
    ) -> Vec<WorkUnit> {
        let (start, end) = self.range();
        days_between(start, end)
            .filter(|day| calendar.is_market_day(day.date_naive()))
            .map(|day| WorkUnit {
                symbol: symbol.to_string(),
                kind,
                start: day,
                end: day + Duration::days(1),
                exchanges: None,
            })
            .collect()
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn days_between(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> impl Iterator<Item = DateTime<Utc>> {
    std::iter::successors(Some(start), |day| Some(*day + Duration::days(1)))
        .take_while(move |day| *day < end)
}

/// Clamp the configured bar period to `[24h, 60 days]`; an exchange filter
/// forces 24h because filtered bars are rebuilt from one day of trades.
pub fn effective_bar_period(configured: StdDuration, exchange_filtered: bool) -> StdDuration {
    if exchange_filtered {
        return MIN_BAR_PERIOD;
    }
    configured.clamp(MIN_BAR_PERIOD, MAX_BAR_PERIOD)
}

/// Parse a `YYYY-MM-DD` date flag
pub fn parse_date(value: &str) -> BackfillResult<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| BackfillError::InvalidDate {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

pub fn parse_period(value: &str) -> BackfillResult<StdDuration> {
    parse_duration(value).ok_or_else(|| BackfillError::InvalidDuration(value.to_string()))
}

/// `*` means no filter, otherwise a comma-separated list of integer IDs
pub fn parse_exchanges(value: &str) -> BackfillResult<Option<Vec<i32>>> {
    let value = value.trim();
    if value == "*" || value.is_empty() {
        return Ok(None);
    }
    value
        .split(',')
        .map(|id| {
            id.trim()
                .parse::<i32>()
                .map_err(|_| BackfillError::InvalidExchange(id.to_string()))
        })
        .collect::<BackfillResult<Vec<_>>>()
        .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::MarketCalendar;
    use chrono::{Datelike, Weekday};
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn weekdays(d: NaiveDate) -> bool {
        !matches!(d.weekday(), Weekday::Sat | Weekday::Sun)
    }

    fn plan(kinds: KindSelection, from: NaiveDate, to: NaiveDate) -> BackfillPlan {
        BackfillPlan::new(vec!["AAPL".into(), "MSFT".into()], from, to, kinds).unwrap()
    }

    const ALL: KindSelection = KindSelection {
        bars: true,
        quotes: true,
        trades: true,
    };

    #[test]
    fn test_effective_bar_period_clamps() {
        let hour = StdDuration::from_secs(3600);
        assert_eq!(effective_bar_period(hour, false), MIN_BAR_PERIOD);
        assert_eq!(effective_bar_period(hour * 24 * 90, false), MAX_BAR_PERIOD);
        assert_eq!(effective_bar_period(hour * 24 * 7, false), hour * 24 * 7);
        assert_eq!(effective_bar_period(hour * 24 * 7, true), MIN_BAR_PERIOD);
    }

    #[test]
    fn test_parse_exchanges() {
        assert_eq!(parse_exchanges("*").unwrap(), None);
        assert_eq!(parse_exchanges("1,12").unwrap(), Some(vec![1, 12]));
        assert!(matches!(
            parse_exchanges("1,nyse"),
            Err(BackfillError::InvalidExchange(id)) if id == "nyse"
        ));
    }

    #[test]
    fn test_parse_date_and_period() {
        assert_eq!(parse_date("2024-03-11").unwrap(), date(2024, 3, 11));
        assert!(parse_date("03/11/2024").is_err());
        assert_eq!(parse_period("48h").unwrap(), StdDuration::from_secs(172_800));
        assert!(parse_period("two days").is_err());
    }

    #[test]
    fn test_empty_range_rejected() {
        let err = BackfillPlan::new(vec![], date(2024, 3, 11), date(2024, 3, 11), ALL);
        assert!(matches!(err, Err(BackfillError::InvalidRange { .. })));
    }

    #[test]
    fn test_weekend_produces_no_units() {
        // Mon 2024-03-11 .. Mon 2024-03-18 exclusive: five weekdays
        let p = plan(ALL, date(2024, 3, 11), date(2024, 3, 18));
        let units = p.enumerate(&weekdays);
        assert_eq!(units.len(), 2 * 3 * 5);
        assert!(units.iter().all(|u| weekdays(u.day())));
    }

    #[test]
    fn test_quotes_and_trades_use_start_of_day() {
        let kinds = KindSelection {
            trades: true,
            ..Default::default()
        };
        let p = plan(kinds, date(2024, 3, 11), date(2024, 3, 13));
        let units = p.enumerate(&weekdays);
        let starts: Vec<_> = units.iter().map(|u| u.start).collect();
        assert_eq!(
            starts,
            vec![
                start_of_day(date(2024, 3, 11)),
                start_of_day(date(2024, 3, 12)),
                start_of_day(date(2024, 3, 11)),
                start_of_day(date(2024, 3, 12)),
            ]
        );
        assert!(units.iter().all(|u| u.end - u.start == Duration::days(1)));
    }

    #[test]
    fn test_bar_chunks_cover_range_and_truncate() {
        let kinds = KindSelection {
            bars: true,
            ..Default::default()
        };
        // Sat 2024-03-09 .. Fri 2024-03-22, 7 day chunks
        let p = plan(kinds, date(2024, 3, 9), date(2024, 3, 22))
            .with_bar_period(StdDuration::from_secs(7 * 86_400));
        let units: Vec<_> = p
            .enumerate(&weekdays)
            .into_iter()
            .filter(|u| u.symbol == "AAPL")
            .collect();
        assert_eq!(units.len(), 2);
        // First chunk opens on Saturday, unit starts on Monday
        assert_eq!(units[0].day(), date(2024, 3, 11));
        assert_eq!(units[0].end, start_of_day(date(2024, 3, 16)));
        // Second chunk is cut at the range end
        assert_eq!(units[1].day(), date(2024, 3, 18));
        assert_eq!(units[1].end, start_of_day(date(2024, 3, 22)));
    }

    #[test]
    fn test_exchange_filter_forces_daily_bars() {
        let kinds = KindSelection {
            bars: true,
            ..Default::default()
        };
        let p = plan(kinds, date(2024, 3, 11), date(2024, 3, 16))
            .with_bar_period(StdDuration::from_secs(30 * 86_400))
            .with_exchanges(Some(vec![4]));
        let units = p.enumerate(&weekdays);
        assert_eq!(units.len(), 2 * 5);
        assert!(units
            .iter()
            .all(|u| u.end - u.start == Duration::days(1) && u.exchanges == Some(vec![4])));
    }

    #[test]
    fn test_holidays_are_skipped() {
        let kinds = KindSelection {
            quotes: true,
            ..Default::default()
        };
        // Week of July 4th 2024 (Thursday)
        let p = plan(kinds, date(2024, 7, 1), date(2024, 7, 6));
        let days: Vec<_> = p
            .enumerate(&MarketCalendar::nasdaq())
            .into_iter()
            .filter(|u| u.symbol == "AAPL")
            .map(|u| u.day())
            .collect();
        assert_eq!(
            days,
            vec![date(2024, 7, 1), date(2024, 7, 2), date(2024, 7, 3), date(2024, 7, 5)]
        );
    }

    proptest! {
        #[test]
        fn prop_enumeration_is_idempotent(offset in 0i64..400, span in 1i64..60, period_days in 1u64..90) {
            let from = date(2023, 1, 1) + Duration::days(offset);
            let to = from + Duration::days(span);
            let p = plan(ALL, from, to).with_bar_period(StdDuration::from_secs(period_days * 86_400));
            let first = p.enumerate(&weekdays);
            let second = p.enumerate(&weekdays);
            prop_assert_eq!(&first, &second);
            for unit in &first {
                prop_assert!(weekdays(unit.day()));
                prop_assert!(unit.start < unit.end);
                prop_assert!(unit.start >= start_of_day(from) && unit.end <= start_of_day(to));
            }
        }
    }
}
