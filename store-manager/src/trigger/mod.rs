//! Write triggers
//!
//! A trigger reacts to batches written under keys matching its glob and may
//! produce derived batches (aggregated bars) that the store writes back.
//! Triggers run off the write path, in background tasks tracked by the
//! storage durability barrier.

mod aggregate;

pub use aggregate::{AggTrigger, Timeframe};

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::glob::GlobPattern;
use crate::schema::{TimeBucketKey, WriteEvent};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TriggerError {
    #[error("Unknown trigger module '{0}'")]
    UnknownModule(String),

    #[error("Invalid timeframe '{0}'")]
    InvalidTimeframe(String),

    #[error("Unknown session filter '{0}'")]
    UnknownFilter(String),

    #[error("Trigger needs at least one destination")]
    NoDestinations,

    #[error("Invalid key pattern: {0}")]
    Pattern(String),
}

/// Trigger parameters as they appear in settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TriggerConfig {
    /// Session filter, currently only `nasdaq`
    #[serde(default)]
    pub filter: Option<String>,
    pub destinations: Vec<String>,
}

/// One `triggers:` entry in the server settings file
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerSetting {
    pub module: String,
    /// Key glob, e.g. `*/1Min/OHLCV`
    pub on: String,
    pub config: TriggerConfig,
}

pub trait Trigger: Send + Sync {
    fn name(&self) -> &str;

    /// Derive new batches from a written one
    fn fire(&self, event: &WriteEvent) -> Vec<WriteEvent>;
}

/// Binds a trigger to the keys it listens on
#[derive(Clone)]
pub struct TriggerMatcher {
    pattern: GlobPattern,
    trigger: Arc<dyn Trigger>,
}

impl TriggerMatcher {
    pub fn new(trigger: Arc<dyn Trigger>, on: &str) -> Result<Self, TriggerError> {
        let pattern = GlobPattern::compile(on).map_err(|e| TriggerError::Pattern(e.to_string()))?;
        Ok(Self { pattern, trigger })
    }

    pub fn matches(&self, key: &TimeBucketKey) -> bool {
        self.pattern.matches(key.as_str())
    }

    pub fn trigger(&self) -> &Arc<dyn Trigger> {
        &self.trigger
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

impl std::fmt::Debug for TriggerMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerMatcher")
            .field("pattern", &self.pattern.as_str())
            .field("trigger", &self.trigger.name())
            .finish()
    }
}

/// Build a matcher from a settings entry
pub fn build_matcher(setting: &TriggerSetting) -> Result<TriggerMatcher, TriggerError> {
    let trigger: Arc<dyn Trigger> = match setting.module.as_str() {
        "ondiskagg" | "ondiskagg.so" | "aggregate" => Arc::new(AggTrigger::new(&setting.config)?),
        other => return Err(TriggerError::UnknownModule(other.to_string())),
    };
    TriggerMatcher::new(trigger, &setting.on)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setting(module: &str) -> TriggerSetting {
        TriggerSetting {
            module: module.into(),
            on: "*/1Min/OHLCV".into(),
            config: TriggerConfig {
                filter: Some("nasdaq".into()),
                destinations: vec!["5Min".into(), "1D".into()],
            },
        }
    }

    #[test]
    fn test_build_aggregate_matcher() {
        let matcher = build_matcher(&setting("ondiskagg.so")).unwrap();
        assert!(matcher.matches(&TimeBucketKey::bars("AAPL", "1Min")));
        assert!(!matcher.matches(&TimeBucketKey::bars("AAPL", "5Min")));
        assert_eq!(matcher.trigger().name(), "ondiskagg");
    }

    #[test]
    fn test_unknown_module() {
        assert!(matches!(
            build_matcher(&setting("stream")),
            Err(TriggerError::UnknownModule(_))
        ));
    }
}
