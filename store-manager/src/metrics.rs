// metrics.rs - Prometheus metrics for the backfill job and the server

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Backfill Metrics
    // ============================================================================

    /// Work units handed to the admission pool
    pub static ref BACKFILL_UNITS_DISPATCHED: IntCounter = IntCounter::new(
        "mkts_backfill_units_dispatched_total",
        "Total number of backfill work units dispatched"
    ).expect("Failed to create backfill_units_dispatched metric");

    /// Work units abandoned after an ingestion error
    pub static ref BACKFILL_UNITS_FAILED: IntCounter = IntCounter::new(
        "mkts_backfill_units_failed_total",
        "Total number of backfill work units that failed"
    ).expect("Failed to create backfill_units_failed metric");

    /// Work units currently holding an admission token
    pub static ref BACKFILL_UNITS_IN_FLIGHT: IntGauge = IntGauge::new(
        "mkts_backfill_units_in_flight",
        "Number of backfill work units currently executing"
    ).expect("Failed to create backfill_units_in_flight metric");

    /// Duration of individual data source calls
    pub static ref API_CALL_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "mkts_api_call_duration_seconds",
            "Duration of market data source calls in seconds"
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0])
    ).expect("Failed to create api_call_duration metric");

    // ============================================================================
    // Server Lifecycle Metrics
    // ============================================================================

    /// Numeric lifecycle state (0=Initializing .. 6=Terminated)
    pub static ref LIFECYCLE_STATE: IntGauge = IntGauge::new(
        "mkts_lifecycle_state",
        "Current server lifecycle state"
    ).expect("Failed to create lifecycle_state metric");

    /// Query readiness (1=queryable, 0=not serving queries)
    pub static ref QUERYABLE: IntGauge = IntGauge::new(
        "mkts_queryable",
        "Whether the server accepts query traffic"
    ).expect("Failed to create queryable metric");

    /// Requests rejected because the readiness gate was closed
    pub static ref QUERIES_REJECTED: IntCounter = IntCounter::new(
        "mkts_queries_rejected_total",
        "Total number of API requests rejected while not queryable"
    ).expect("Failed to create queries_rejected metric");

    // ============================================================================
    // Storage & Replication Metrics
    // ============================================================================

    /// Write batches accepted by the storage engine
    pub static ref STORAGE_WRITES: IntCounter = IntCounter::new(
        "mkts_storage_writes_total",
        "Total number of write batches accepted by storage"
    ).expect("Failed to create storage_writes metric");

    /// Writes not yet durably flushed
    pub static ref PENDING_DURABLE_WRITES: IntGauge = IntGauge::new(
        "mkts_pending_durable_writes",
        "Number of writes waiting to be durably flushed"
    ).expect("Failed to create pending_durable_writes metric");

    /// Connected replicas (master) or 1 when attached to a master (client)
    pub static ref REPLICATION_PEERS: IntGauge = IntGauge::new(
        "mkts_replication_peers",
        "Number of connected replication peers"
    ).expect("Failed to create replication_peers metric");

    /// Aggregated bars written by triggers
    pub static ref TRIGGER_BARS_WRITTEN: IntCounter = IntCounter::new(
        "mkts_trigger_bars_written_total",
        "Total number of aggregated bars written by triggers"
    ).expect("Failed to create trigger_bars_written metric");

    // ============================================================================
    // System Health Metrics
    // ============================================================================

    /// Application uptime in seconds
    pub static ref UPTIME_SECONDS: IntGauge = IntGauge::new(
        "mkts_uptime_seconds",
        "Application uptime in seconds"
    ).expect("Failed to create uptime_seconds metric");
}

/// Register all metrics with the global registry
pub fn register_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(BACKFILL_UNITS_DISPATCHED.clone()))?;
    REGISTRY.register(Box::new(BACKFILL_UNITS_FAILED.clone()))?;
    REGISTRY.register(Box::new(BACKFILL_UNITS_IN_FLIGHT.clone()))?;
    REGISTRY.register(Box::new(API_CALL_DURATION.clone()))?;

    REGISTRY.register(Box::new(LIFECYCLE_STATE.clone()))?;
    REGISTRY.register(Box::new(QUERYABLE.clone()))?;
    REGISTRY.register(Box::new(QUERIES_REJECTED.clone()))?;

    REGISTRY.register(Box::new(STORAGE_WRITES.clone()))?;
    REGISTRY.register(Box::new(PENDING_DURABLE_WRITES.clone()))?;
    REGISTRY.register(Box::new(REPLICATION_PEERS.clone()))?;
    REGISTRY.register(Box::new(TRIGGER_BARS_WRITTEN.clone()))?;

    REGISTRY.register(Box::new(UPTIME_SECONDS.clone()))?;

    Ok(())
}

/// Render the registry in the Prometheus text exposition format
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(buffer)
}
