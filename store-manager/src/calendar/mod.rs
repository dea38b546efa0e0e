//! Trading calendar
//!
//! Answers "is there a market session on this date" for the backfill
//! enumerator and "is this instant inside the regular session" for the
//! aggregation trigger's `nasdaq` filter.
//!
//! Sessions are defined in exchange-local time using `chrono_tz`, so DST
//! transitions are handled by the timezone database.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;

/// Oracle consulted before a work unit is created for a date
pub trait TradingCalendar: Send + Sync {
    fn is_market_day(&self, date: NaiveDate) -> bool;
}

impl<F> TradingCalendar for F
where
    F: Fn(NaiveDate) -> bool + Send + Sync,
{
    fn is_market_day(&self, date: NaiveDate) -> bool {
        self(date)
    }
}

/// Exchange calendar with a regular session and rule-based holidays
#[derive(Debug, Clone)]
pub struct MarketCalendar {
    timezone: Tz,
    open: NaiveTime,
    close: NaiveTime,
    /// Extra closures on top of the rule-based US holidays
    extra_holidays: HashSet<NaiveDate>,
}

impl MarketCalendar {
    /// Nasdaq regular session, 09:30-16:00 America/New_York
    pub fn nasdaq() -> Self {
        Self {
            timezone: chrono_tz::America::New_York,
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or_default(),
            extra_holidays: HashSet::new(),
        }
    }

    /// Add an ad-hoc closure (national days of mourning and the like)
    pub fn with_holiday(mut self, date: NaiveDate) -> Self {
        self.extra_holidays.insert(date);
        self
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.extra_holidays.contains(&date) || us_market_holidays(date.year()).contains(&date)
    }

    /// Check if the regular session is open at the given UTC time
    pub fn is_open(&self, utc_time: DateTime<Utc>) -> bool {
        let local = utc_time.with_timezone(&self.timezone);
        let time = local.time();
        self.is_market_day(local.date_naive()) && time >= self.open && time < self.close
    }
}

impl TradingCalendar for MarketCalendar {
    fn is_market_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.is_holiday(date)
    }
}

/// NYSE/Nasdaq full-day closures for `year`
fn us_market_holidays(year: i32) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(10);
    let fixed = |month, day| NaiveDate::from_ymd_opt(year, month, day);

    // New Year's Day falling on Saturday is not observed on the prior Friday
    if let Some(date) = fixed(1, 1) {
        match date.weekday() {
            Weekday::Sat => {}
            Weekday::Sun => days.extend(date.succ_opt()),
            _ => days.push(date),
        }
    }
    days.extend(nth_weekday(year, 1, Weekday::Mon, 3));
    days.extend(nth_weekday(year, 2, Weekday::Mon, 3));
    days.extend(easter_sunday(year).map(|easter| easter - Duration::days(2)));
    days.extend(last_weekday(year, 5, Weekday::Mon));
    if year >= 2022 {
        days.extend(fixed(6, 19).map(observed));
    }
    days.extend(fixed(7, 4).map(observed));
    days.extend(nth_weekday(year, 9, Weekday::Mon, 1));
    days.extend(nth_weekday(year, 11, Weekday::Thu, 4));
    days.extend(fixed(12, 25).map(observed));
    days
}

/// Saturday holidays move to Friday, Sunday holidays to Monday
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    nth_weekday(year, month, weekday, 5).or_else(|| nth_weekday(year, month, weekday, 4))
}

/// Anonymous Gregorian computus
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_weekends_are_closed() {
        let cal = MarketCalendar::nasdaq();
        assert!(!cal.is_market_day(date(2024, 3, 9)));
        assert!(!cal.is_market_day(date(2024, 3, 10)));
        assert!(cal.is_market_day(date(2024, 3, 11)));
    }

    #[test]
    fn test_known_holidays_2024() {
        let cal = MarketCalendar::nasdaq();
        for d in [
            date(2024, 1, 1),
            date(2024, 1, 15),
            date(2024, 2, 19),
            date(2024, 3, 29),
            date(2024, 5, 27),
            date(2024, 6, 19),
            date(2024, 7, 4),
            date(2024, 9, 2),
            date(2024, 11, 28),
            date(2024, 12, 25),
        ] {
            assert!(!cal.is_market_day(d), "{} should be a holiday", d);
        }
    }

    #[test]
    fn test_observed_holidays() {
        let cal = MarketCalendar::nasdaq();
        // July 4th 2026 is a Saturday, observed Friday
        assert!(!cal.is_market_day(date(2026, 7, 3)));
        // Christmas 2022 is a Sunday, observed Monday
        assert!(!cal.is_market_day(date(2022, 12, 26)));
        // New Year 2022 is a Saturday and is not observed on Friday
        assert!(cal.is_market_day(date(2021, 12, 31)));
    }

    #[test]
    fn test_extra_holiday() {
        let cal = MarketCalendar::nasdaq().with_holiday(date(2025, 1, 9));
        assert!(!cal.is_market_day(date(2025, 1, 9)));
    }

    #[test]
    fn test_regular_session_bounds() {
        let cal = MarketCalendar::nasdaq();
        // 2024-03-11 is EDT (UTC-4): session is 13:30-20:00 UTC
        assert!(!cal.is_open(Utc.with_ymd_and_hms(2024, 3, 11, 13, 29, 0).unwrap()));
        assert!(cal.is_open(Utc.with_ymd_and_hms(2024, 3, 11, 13, 30, 0).unwrap()));
        assert!(!cal.is_open(Utc.with_ymd_and_hms(2024, 3, 11, 20, 0, 0).unwrap()));
    }

    #[test]
    fn test_closure_calendar() {
        let cal = |d: NaiveDate| d.day() % 2 == 0;
        assert!(cal.is_market_day(date(2024, 1, 2)));
        assert!(!cal.is_market_day(date(2024, 1, 3)));
    }
}
