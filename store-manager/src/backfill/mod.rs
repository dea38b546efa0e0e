//! Backfill scheduler
//!
//! Bulk ingestion of historical bars, quotes and trades from a data source
//! into the store. The job is split into independent work units (one symbol,
//! one data kind, one time window) that run with bounded parallelism:
//!
//! ```text
//! symbols (glob) ──► BackfillPlan::enumerate ──► Vec<WorkUnit>
//!                                                     │
//!                      AdmissionPool (N tokens) ◄─────┤ acquire (blocks)
//!                                                     ▼
//!                               DataSource::{bars,quotes,trades,...}
//!                                                     │
//!                                                     ▼
//!                                        StorageEngine::write
//! ```
//!
//! A failed unit is logged and skipped. The batch ends when the pool has been
//! refilled to full capacity, which proves every unit has released its token.

mod plan;
mod pool;
mod scheduler;
mod symbols;

pub use plan::{
    effective_bar_period, parse_date, parse_exchanges, parse_period, BackfillPlan, DataKind,
    KindSelection, WorkUnit, MAX_BAR_PERIOD, MIN_BAR_PERIOD,
};
pub use pool::{AdmissionPool, AdmissionToken, TaskPool};
pub use scheduler::{
    default_parallelism, BackfillReport, BackfillScheduler, SchedulerConfig, DEFAULT_BATCH_SIZE,
    DEFAULT_SETTLE_WAIT,
};
pub use symbols::{compile_pattern, resolve_symbols, select_symbols};

use std::time::Duration;

use store_common::error::{ConfigurationError, ErrorCategory, ErrorClassification};
use thiserror::Error;

use crate::provider::ProviderError;
use crate::storage::StorageError;
use crate::trigger::TriggerError;

/// Errors that abort a backfill before any unit is dispatched
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BackfillError {
    #[error("Invalid date '{value}': {reason}")]
    InvalidDate { value: String, reason: String },

    #[error("Invalid range: from {from} is not before to {to}")]
    InvalidRange { from: String, to: String },

    #[error("Invalid duration '{0}'")]
    InvalidDuration(String),

    #[error("Invalid exchange ID: {0}")]
    InvalidExchange(String),

    #[error("Invalid symbol pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Data source API key is required")]
    MissingApiKey,

    #[error("Failed to list symbols: {0}")]
    TickerListing(#[source] ProviderError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),
}

impl ErrorClassification for BackfillError {
    fn category(&self) -> ErrorCategory {
        match self {
            BackfillError::TickerListing(e) => e.category(),
            BackfillError::Storage(e) => e.category(),
            _ => ErrorCategory::Configuration,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            BackfillError::TickerListing(e) => e.suggested_retry_delay(),
            _ => None,
        }
    }
}

pub type BackfillResult<T> = Result<T, BackfillError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_errors_are_fatal() {
        assert!(BackfillError::MissingApiKey.is_fatal());
        assert!(BackfillError::InvalidExchange("x".into()).is_fatal());
    }

    #[test]
    fn test_ticker_listing_inherits_provider_category() {
        let err = BackfillError::TickerListing(ProviderError::Unreachable("reset".into()));
        assert!(err.is_transient());
        assert!(err.to_string().contains("reset"));
    }
}
