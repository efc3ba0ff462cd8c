//! Orchestrator metrics
//!
//! Counters exported on `/metrics`. The registry is owned rather than the
//! process-global one so several orchestrators (and tests) can coexist.

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Arc;

use crate::error::{Error, Result};

const NAMESPACE: &str = "console_orchestrator";

/// Metric set for one orchestrator
pub struct Metrics {
    registry: Registry,
    /// Snapshots created, by trigger
    pub snapshots_created: IntCounterVec,
    /// Snapshot reads, by operation (list/detail)
    pub snapshot_reads: IntCounterVec,
    /// Volume summary lookups, by result (hit/miss)
    pub summary_cache: IntCounterVec,
    /// Pod eviction attempts, by outcome
    pub evictions: IntCounterVec,
    /// Node purges, by result
    pub node_purges: IntCounterVec,
    /// Duration of orchestrator operations
    pub operation_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let snapshots_created = counter(
            &registry,
            "snapshots_created_total",
            "Snapshots created",
            &["trigger"],
        )?;
        let snapshot_reads = counter(
            &registry,
            "snapshot_reads_total",
            "Snapshot list and detail reads",
            &["operation"],
        )?;
        let summary_cache = counter(
            &registry,
            "volume_summary_cache_total",
            "Volume summary cache lookups",
            &["result"],
        )?;
        let evictions = counter(
            &registry,
            "pod_evictions_total",
            "Pod eviction attempts by outcome",
            &["outcome"],
        )?;
        let node_purges = counter(
            &registry,
            "node_purges_total",
            "Node purges by result",
            &["result"],
        )?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new("operation_duration_seconds", "Duration of orchestrator operations")
                .namespace(NAMESPACE),
            &["operation"],
        )
        .map_err(metrics_error)?;
        registry
            .register(Box::new(operation_duration.clone()))
            .map_err(metrics_error)?;

        Ok(Arc::new(Self {
            registry,
            snapshots_created,
            snapshot_reads,
            summary_cache,
            evictions,
            node_purges,
            operation_duration,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the text exposition format
    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        use prometheus::{Encoder, TextEncoder};

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let counter =
        IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels).map_err(metrics_error)?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(metrics_error)?;
    Ok(counter)
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
