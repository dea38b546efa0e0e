//! # Store Manager
//!
//! Orchestration layer of the market store.
//!
//! ## Features
//!
//! - **Backfill**: bulk historical ingestion from Polygon, split into
//!   per-symbol, per-window units run with bounded parallelism
//! - **Server lifecycle**: ordered startup of storage, replication and the
//!   network listeners behind a readiness gate, and a run-once shutdown that
//!   waits for durable writes
//! - **Replication**: master/replica streaming of accepted writes
//! - **Triggers**: on-write aggregation of 1Min bars into higher timeframes

pub mod backfill;
pub mod calendar;
pub mod cli;
pub mod config;
pub mod frontend;
pub mod glob;
pub mod lifecycle;
pub mod metrics;
pub mod provider;
pub mod replication;
pub mod schema;
pub mod storage;
pub mod trigger;

// Re-export commonly used types
pub use backfill::{BackfillError, BackfillPlan, BackfillScheduler, WorkUnit};
pub use calendar::{MarketCalendar, TradingCalendar};
pub use config::ServerSettings;
pub use lifecycle::{LifecycleError, LifecycleManager, ReadinessGate};
pub use provider::{DataSource, ProviderError, ProviderResult};
pub use schema::{TimeBucketKey, WriteEvent};
pub use storage::{StorageEngine, StorageError, StorageFactory};
