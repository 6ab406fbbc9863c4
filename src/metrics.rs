//! Prometheus metrics for spooling activity
//!
//! Metrics are updated regardless of whether [`init_metrics`] was called;
//! registration only makes them visible to [`export_metrics`].

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::{error, info};

lazy_static::lazy_static! {
    /// Global metrics registry
    pub static ref METRICS_REGISTRY: Registry = Registry::new();

    pub static ref BYTES_SPOOLED: IntCounter = IntCounter::new(
        "resultspool_bytes_spooled_total",
        "Total encoded bytes written by spoolers"
    ).unwrap();

    pub static ref SPILLS_TO_DISK: IntCounter = IntCounter::new(
        "resultspool_spills_to_disk_total",
        "Number of spoolers that overflowed to disk"
    ).unwrap();

    pub static ref SPOOL_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("resultspool_spool_failures_total", "Spooling operations that failed"),
        &["reason"]
    ).unwrap();

    pub static ref MEMORY_RESERVED: IntGauge = IntGauge::new(
        "resultspool_memory_reserved_bytes",
        "Bytes currently reserved from memory managers"
    ).unwrap();
}

/// Initialize metrics registry
pub fn init_metrics() {
    info!("Initializing Prometheus metrics");

    METRICS_REGISTRY.register(Box::new(BYTES_SPOOLED.clone())).ok();
    METRICS_REGISTRY.register(Box::new(SPILLS_TO_DISK.clone())).ok();
    METRICS_REGISTRY.register(Box::new(SPOOL_FAILURES.clone())).ok();
    METRICS_REGISTRY.register(Box::new(MEMORY_RESERVED.clone())).ok();
}

/// Export registered metrics in Prometheus text format
pub fn export_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = METRICS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return String::new();
    }

    String::from_utf8(buffer).unwrap_or_default()
}
