use std::time::Duration;

use super::common::{ConfigurationError, NetworkError};

/// How a failure should be treated by whoever observes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network hiccups, timeouts, a closed peer
    Transient,
    /// Retrying the same input fails the same way
    Permanent,
    /// Upstream quota or rate limit hit
    ResourceExhausted,
    /// Operator has to fix settings or flags
    Configuration,
    /// Broken invariant inside this process
    Internal,
}

/// Lets a backfill unit, a replication loop or a startup stage decide
/// between logging and aborting without knowing the concrete error.
pub trait ErrorClassification {
    fn category(&self) -> ErrorCategory;

    fn is_transient(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Transient | ErrorCategory::ResourceExhausted
        )
    }

    fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Configuration | ErrorCategory::Internal
        )
    }

    /// Backoff hint; `None` when waiting would not help
    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self.category() {
            ErrorCategory::Transient => Some(Duration::from_secs(1)),
            ErrorCategory::ResourceExhausted => Some(Duration::from_secs(60)),
            _ => None,
        }
    }
}

impl ErrorClassification for NetworkError {
    fn category(&self) -> ErrorCategory {
        match self {
            // A taken port stays taken
            NetworkError::Bind { .. } => ErrorCategory::Configuration,
        }
    }
}

impl ErrorClassification for ConfigurationError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}
