use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use store_common::error::{ErrorCategory, ErrorClassification};
use thiserror::Error;

use crate::storage::StorageError;

/// Failure of a single data-source call.
///
/// Backfill units log these and move on; classification only decides how
/// loudly.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("No API key configured")]
    MissingApiKey,

    #[error("Cannot reach data source: {0}")]
    Unreachable(String),

    #[error("Request failed: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Unexpected response payload: {0}")]
    Decode(String),

    #[error("No data for {0}")]
    NoData(String),

    #[error("Timestamp {0} cannot be expressed in nanoseconds")]
    WindowOutOfRange(DateTime<Utc>),

    #[error("HTTP client setup failed: {0}")]
    Client(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ErrorClassification for ProviderError {
    fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::MissingApiKey | ProviderError::Client(_) => ErrorCategory::Configuration,
            ProviderError::Unreachable(_) | ProviderError::Transport(_) => ErrorCategory::Transient,
            ProviderError::Http { status, .. } => match status {
                401 | 403 => ErrorCategory::Configuration,
                429 => ErrorCategory::ResourceExhausted,
                500..=599 => ErrorCategory::Transient,
                _ => ErrorCategory::Permanent,
            },
            ProviderError::Decode(_) | ProviderError::NoData(_) => ErrorCategory::Permanent,
            ProviderError::WindowOutOfRange(_) => ErrorCategory::Internal,
            ProviderError::Storage(e) => e.category(),
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            ProviderError::Storage(e) => e.suggested_retry_delay(),
            ProviderError::Unreachable(_) => Some(Duration::from_secs(2)),
            _ => match self.category() {
                ErrorCategory::Transient => Some(Duration::from_millis(500)),
                ErrorCategory::ResourceExhausted => Some(Duration::from_secs(60)),
                _ => None,
            },
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Historical data source that ingests directly into storage.
///
/// Windows are half-open `[start, end)` in UTC. Each call returns the number
/// of rows written.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    /// All tickers the source knows about
    async fn list_tickers(&self) -> ProviderResult<Vec<String>>;

    /// 1Min bars over `[start, end)`
    async fn bars(&self, symbol: &str, start: DateTime<Utc>, end: DateTime<Utc>)
        -> ProviderResult<usize>;

    /// 1Min bars for one day rebuilt from trades on the given exchanges
    async fn bars_from_trades(
        &self,
        symbol: &str,
        day: DateTime<Utc>,
        exchanges: &[i32],
        batch_size: usize,
    ) -> ProviderResult<usize>;

    async fn quotes(
        &self,
        symbol: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        batch_size: usize,
    ) -> ProviderResult<usize>;

    /// Trades for the calendar day starting at `day`
    async fn trades(&self, symbol: &str, day: DateTime<Utc>, batch_size: usize)
        -> ProviderResult<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> ProviderError {
        ProviderError::Http {
            status,
            body: String::new(),
        }
    }

    #[test]
    fn test_http_status_classification() {
        assert!(http(401).is_fatal());
        assert!(http(429).is_transient());
        assert_eq!(http(429).suggested_retry_delay(), Some(Duration::from_secs(60)));
        assert!(http(503).is_transient());
        assert_eq!(http(404).category(), ErrorCategory::Permanent);
    }

    #[test]
    fn test_missing_key_is_fatal() {
        assert!(ProviderError::MissingApiKey.is_fatal());
    }
}
