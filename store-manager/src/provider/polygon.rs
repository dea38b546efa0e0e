//! Polygon.io REST client
//!
//! Reference tickers and quotes/trades are paged through `next_url`; minute
//! aggregates come back in a single response per window.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

use super::{DataSource, ProviderError, ProviderResult};
use crate::schema::{Bar, Quote, Row, TimeBucketKey, Trade, WriteEvent, MINUTE_TIMEFRAME};
use crate::storage::StorageEngine;

const DEFAULT_BASE_URL: &str = "https://api.polygon.io";
const TICKER_PAGE_LIMIT: usize = 1_000;
const AGGS_LIMIT: usize = 50_000;

#[derive(Debug, Clone)]
pub struct PolygonConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl PolygonConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    results: Vec<T>,
    #[serde(default)]
    next_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TickerEntry {
    ticker: String,
}

#[derive(Debug, Deserialize)]
struct AggEntry {
    /// Window start, epoch milliseconds
    t: i64,
    o: Decimal,
    h: Decimal,
    l: Decimal,
    c: Decimal,
    v: Decimal,
}

#[derive(Debug, Deserialize)]
struct QuoteEntry {
    sip_timestamp: i64,
    #[serde(default)]
    bid_price: Decimal,
    #[serde(default)]
    bid_size: Decimal,
    #[serde(default)]
    ask_price: Decimal,
    #[serde(default)]
    ask_size: Decimal,
}

#[derive(Debug, Deserialize)]
struct TradeEntry {
    sip_timestamp: i64,
    price: Decimal,
    size: Decimal,
    #[serde(default)]
    exchange: i32,
    #[serde(default)]
    conditions: Vec<i32>,
}

impl From<TradeEntry> for Trade {
    fn from(t: TradeEntry) -> Self {
        Trade {
            epoch_ns: t.sip_timestamp,
            price: t.price,
            size: t.size,
            exchange: t.exchange,
            conditions: t.conditions,
        }
    }
}

/// Data source backed by the Polygon REST API, writing into `storage`
pub struct PolygonClient {
    client: Client,
    config: PolygonConfig,
    storage: Arc<dyn StorageEngine>,
}

impl PolygonClient {
    pub fn new(config: PolygonConfig, storage: Arc<dyn StorageEngine>) -> ProviderResult<Self> {
        if config.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey);
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Client(e.to_string()))?;
        Ok(Self {
            client,
            config,
            storage,
        })
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> ProviderResult<Page<T>> {
        debug!("GET {}", url);
        let response = self
            .client
            .get(url)
            .query(params)
            .query(&[("apiKey", self.config.api_key.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    ProviderError::Unreachable(e.to_string())
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| ProviderError::Decode(format!("{} - body: {}", e, truncate(&body))))
        } else {
            Err(ProviderError::Http {
                status: status.as_u16(),
                body: truncate(&body),
            })
        }
    }

    /// Walk every page of a `next_url` paginated endpoint
    async fn for_each_page<T, F>(
        &self,
        path: &str,
        params: Vec<(&str, String)>,
        mut on_page: F,
    ) -> ProviderResult<()>
    where
        T: DeserializeOwned,
        F: FnMut(Vec<T>) -> Option<WriteEvent>,
    {
        let mut page: Page<T> = self
            .get_page(&format!("{}{}", self.config.base_url, path), &params)
            .await?;
        loop {
            let next = page.next_url.take();
            if let Some(event) = on_page(std::mem::take(&mut page.results)) {
                self.storage.write(event).await?;
            }
            match next {
                Some(url) => page = self.get_page(&url, &[]).await?,
                None => return Ok(()),
            }
        }
    }

    async fn fetch_trades(
        &self,
        symbol: &str,
        day: DateTime<Utc>,
        batch_size: usize,
    ) -> ProviderResult<Vec<Trade>> {
        let (gte, lt) = day_bounds_ns(day)?;
        let mut trades = Vec::new();
        self.for_each_page::<TradeEntry, _>(
            &format!("/v3/trades/{}", symbol),
            vec![
                ("timestamp.gte", gte.to_string()),
                ("timestamp.lt", lt.to_string()),
                ("limit", batch_size.to_string()),
                ("sort", "timestamp".to_string()),
                ("order", "asc".to_string()),
            ],
            |entries| {
                trades.extend(entries.into_iter().map(Trade::from));
                None
            },
        )
        .await?;
        Ok(trades)
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(256).collect()
}

fn day_bounds_ns(day: DateTime<Utc>) -> ProviderResult<(i64, i64)> {
    let start = day
        .timestamp_nanos_opt()
        .ok_or(ProviderError::WindowOutOfRange(day))?;
    Ok((start, start + 86_400 * 1_000_000_000))
}

/// Fold trades into 1Min bars, keeping only prints from `exchanges`
/// (all exchanges when empty). Trades must be in time order.
pub fn build_minute_bars(trades: &[Trade], exchanges: &[i32]) -> Vec<Bar> {
    let mut bars: BTreeMap<i64, Bar> = BTreeMap::new();
    for trade in trades
        .iter()
        .filter(|t| exchanges.is_empty() || exchanges.contains(&t.exchange))
    {
        let epoch = trade.epoch_ns.div_euclid(1_000_000_000);
        let minute = epoch - epoch.rem_euclid(60);
        let print = Bar {
            epoch: minute,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.size,
        };
        bars.entry(minute)
            .and_modify(|bar| bar.merge(&print))
            .or_insert(print);
    }
    bars.into_values().collect()
}

#[async_trait]
impl DataSource for PolygonClient {
    fn name(&self) -> &str {
        "polygon"
    }

    async fn list_tickers(&self) -> ProviderResult<Vec<String>> {
        let mut tickers = Vec::new();
        self.for_each_page::<TickerEntry, _>(
            "/v3/reference/tickers",
            vec![
                ("market", "stocks".to_string()),
                ("active", "true".to_string()),
                ("limit", TICKER_PAGE_LIMIT.to_string()),
            ],
            |entries| {
                tickers.extend(entries.into_iter().map(|e| e.ticker));
                None
            },
        )
        .await?;
        Ok(tickers)
    }

    async fn bars(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ProviderResult<usize> {
        // The aggregates endpoint treats `to` as inclusive
        let path = format!(
            "/v2/aggs/ticker/{}/range/1/minute/{}/{}",
            symbol,
            start.timestamp_millis(),
            end.timestamp_millis() - 1
        );
        let mut written = 0;
        self.for_each_page::<AggEntry, _>(
            &path,
            vec![
                ("adjusted", "true".to_string()),
                ("sort", "asc".to_string()),
                ("limit", AGGS_LIMIT.to_string()),
            ],
            |entries| {
                let rows: Vec<Row> = entries
                    .into_iter()
                    .map(|a| {
                        Row::Bar(Bar {
                            epoch: a.t.div_euclid(1_000),
                            open: a.o,
                            high: a.h,
                            low: a.l,
                            close: a.c,
                            volume: a.v,
                        })
                    })
                    .collect();
                written += rows.len();
                (!rows.is_empty())
                    .then(|| WriteEvent::new(TimeBucketKey::bars(symbol, MINUTE_TIMEFRAME), rows))
            },
        )
        .await?;
        Ok(written)
    }

    async fn bars_from_trades(
        &self,
        symbol: &str,
        day: DateTime<Utc>,
        exchanges: &[i32],
        batch_size: usize,
    ) -> ProviderResult<usize> {
        let trades = self.fetch_trades(symbol, day, batch_size).await?;
        let rows: Vec<Row> = build_minute_bars(&trades, exchanges)
            .into_iter()
            .map(Row::Bar)
            .collect();
        let written = rows.len();
        if written > 0 {
            self.storage
                .write(WriteEvent::new(
                    TimeBucketKey::bars(symbol, MINUTE_TIMEFRAME),
                    rows,
                ))
                .await?;
        }
        Ok(written)
    }

    async fn quotes(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        batch_size: usize,
    ) -> ProviderResult<usize> {
        let gte = start
            .timestamp_nanos_opt()
            .ok_or(ProviderError::WindowOutOfRange(start))?;
        let lt = end
            .timestamp_nanos_opt()
            .ok_or(ProviderError::WindowOutOfRange(end))?;

        let mut written = 0;
        self.for_each_page::<QuoteEntry, _>(
            &format!("/v3/quotes/{}", symbol),
            vec![
                ("timestamp.gte", gte.to_string()),
                ("timestamp.lt", lt.to_string()),
                ("limit", batch_size.to_string()),
                ("sort", "timestamp".to_string()),
                ("order", "asc".to_string()),
            ],
            |entries| {
                let rows: Vec<Row> = entries
                    .into_iter()
                    .map(|q| {
                        Row::Quote(Quote {
                            epoch_ns: q.sip_timestamp,
                            bid_price: q.bid_price,
                            bid_size: q.bid_size,
                            ask_price: q.ask_price,
                            ask_size: q.ask_size,
                        })
                    })
                    .collect();
                written += rows.len();
                (!rows.is_empty()).then(|| WriteEvent::new(TimeBucketKey::quotes(symbol), rows))
            },
        )
        .await?;
        Ok(written)
    }

    async fn trades(
        &self,
        symbol: &str,
        day: DateTime<Utc>,
        batch_size: usize,
    ) -> ProviderResult<usize> {
        let (gte, lt) = day_bounds_ns(day)?;
        let mut written = 0;
        self.for_each_page::<TradeEntry, _>(
            &format!("/v3/trades/{}", symbol),
            vec![
                ("timestamp.gte", gte.to_string()),
                ("timestamp.lt", lt.to_string()),
                ("limit", batch_size.to_string()),
                ("sort", "timestamp".to_string()),
                ("order", "asc".to_string()),
            ],
            |entries| {
                let rows: Vec<Row> = entries
                    .into_iter()
                    .map(|t| Row::Trade(t.into()))
                    .collect();
                written += rows.len();
                (!rows.is_empty()).then(|| WriteEvent::new(TimeBucketKey::trades(symbol), rows))
            },
        )
        .await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(secs: i64, price: Decimal, size: Decimal, exchange: i32) -> Trade {
        Trade {
            epoch_ns: secs * 1_000_000_000,
            price,
            size,
            exchange,
            conditions: vec![],
        }
    }

    #[test]
    fn test_minute_bars_from_filtered_trades() {
        let trades = vec![
            trade(60, dec!(10), dec!(1), 4),
            trade(70, dec!(12), dec!(2), 11),
            trade(80, dec!(9), dec!(3), 4),
            trade(125, dec!(11), dec!(5), 4),
        ];

        let bars = build_minute_bars(&trades, &[4]);
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].epoch, 60);
        assert_eq!(bars[0].open, dec!(10));
        assert_eq!(bars[0].high, dec!(10));
        assert_eq!(bars[0].low, dec!(9));
        assert_eq!(bars[0].close, dec!(9));
        assert_eq!(bars[0].volume, dec!(4));
        assert_eq!(bars[1].epoch, 120);

        let unfiltered = build_minute_bars(&trades, &[]);
        assert_eq!(unfiltered[0].high, dec!(12));
    }

    #[test]
    fn test_page_parses_without_next_url() {
        let page: Page<TickerEntry> =
            serde_json::from_str(r#"{"results":[{"ticker":"AAPL"}],"status":"OK"}"#).unwrap();
        assert_eq!(page.results[0].ticker, "AAPL");
        assert!(page.next_url.is_none());
    }

    #[test]
    fn test_day_bounds() {
        let day = DateTime::<Utc>::from_timestamp(86_400, 0).unwrap();
        let (gte, lt) = day_bounds_ns(day).unwrap();
        assert_eq!(lt - gte, 86_400_000_000_000);
    }
}
