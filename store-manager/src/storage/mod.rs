//! Storage engine seam
//!
//! The backfill job and the server both write through [`StorageEngine`].
//! The engine owns the durability barrier that shutdown waits on.

mod barrier;
mod local;

pub use barrier::{DurabilityBarrier, DurabilityGuard};
pub use local::{LocalStore, LocalStoreFactory};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use store_common::error::{ErrorCategory, ErrorClassification};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::schema::{Row, TimeBucketKey, WriteEvent};
use crate::trigger::TriggerMatcher;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage is shutting down, write to {0} rejected")]
    ShuttingDown(String),

    #[error("Durability barrier already waited on")]
    BarrierAlreadyWaited,

    #[error("Invalid root directory {path}: {reason}")]
    InvalidRoot { path: String, reason: String },

    #[error("Bucket key {0} does not map to a path under the root")]
    InvalidKey(String),
}

impl ErrorClassification for StorageError {
    fn category(&self) -> ErrorCategory {
        match self {
            StorageError::Io(_) => ErrorCategory::Transient,
            StorageError::Serialization(_) => ErrorCategory::Permanent,
            StorageError::ShuttingDown(_) => ErrorCategory::Permanent,
            StorageError::BarrierAlreadyWaited => ErrorCategory::Internal,
            StorageError::InvalidRoot { .. } => ErrorCategory::Configuration,
            StorageError::InvalidKey(_) => ErrorCategory::Permanent,
        }
    }

    fn suggested_retry_delay(&self) -> Option<Duration> {
        match self {
            StorageError::Io(_) => Some(Duration::from_millis(100)),
            _ => None,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Receives every locally accepted write, used to feed replicas
pub trait ChangeSink: Send + Sync {
    fn publish(&self, event: &WriteEvent);
}

/// Everything needed to open a storage instance
#[derive(Clone)]
pub struct InstanceSetup {
    pub root_dir: PathBuf,
    pub replication_sender: Option<Arc<dyn ChangeSink>>,
    /// Scan the root directory for existing series at startup
    pub init_catalog: bool,
    /// Keep recent rows in memory for queries
    pub init_wal_cache: bool,
    /// Flush to disk in background tasks instead of on the write path
    pub background_sync: bool,
    /// Skip fsync entirely
    pub wal_bypass: bool,
}

impl InstanceSetup {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            replication_sender: None,
            init_catalog: true,
            init_wal_cache: true,
            background_sync: true,
            wal_bypass: false,
        }
    }

    pub fn with_replication_sender(mut self, sender: Option<Arc<dyn ChangeSink>>) -> Self {
        self.replication_sender = sender;
        self
    }
}

impl std::fmt::Debug for InstanceSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceSetup")
            .field("root_dir", &self.root_dir)
            .field("replication_sender", &self.replication_sender.is_some())
            .field("init_catalog", &self.init_catalog)
            .field("init_wal_cache", &self.init_wal_cache)
            .field("background_sync", &self.background_sync)
            .field("wal_bypass", &self.wal_bypass)
            .finish()
    }
}

#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Accept a batch, fan it out to replicas and fire matching triggers
    async fn write(&self, event: WriteEvent) -> StorageResult<()>;

    /// Apply a batch received from the master; not re-published
    async fn apply_replicated(&self, event: WriteEvent) -> StorageResult<()>;

    /// Most recent `limit` rows under `key`
    async fn query(&self, key: &TimeBucketKey, limit: usize) -> StorageResult<Vec<Row>>;

    fn catalog(&self) -> Vec<TimeBucketKey>;

    fn register_trigger(&self, matcher: TriggerMatcher);

    /// Stream of accepted writes
    fn subscribe(&self) -> broadcast::Receiver<WriteEvent>;

    fn barrier(&self) -> Arc<DurabilityBarrier>;
}

/// Opens storage instances; the lifecycle manager calls it during startup
#[async_trait]
pub trait StorageFactory: Send + Sync {
    async fn initialize(&self, setup: InstanceSetup) -> StorageResult<Arc<dyn StorageEngine>>;
}
