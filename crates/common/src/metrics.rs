//! Metrics collection for Voice Insight
//!
//! This module provides Prometheus metrics for the worker manager. Metrics
//! are updated from the registry's admission, eviction and reaping paths.

use lazy_static::lazy_static;
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for Voice Insight
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub manager: ManagerMetrics,
}

/// Worker manager metrics
#[derive(Debug, Clone)]
pub struct ManagerMetrics {
    /// Workers spawned and health-gated successfully
    pub spawns_total: IntCounter,

    /// Spawns that exited or timed out before becoming healthy
    pub spawn_failures_total: IntCounter,

    /// Ensure calls answered by an existing worker
    pub reuses_total: IntCounter,

    /// Workers evicted to make room for another alias
    pub evictions_total: IntCounter,

    /// Workers stopped by the idle reaper
    pub idle_reaps_total: IntCounter,

    /// Workers removed after their process exited on its own
    pub dead_reaps_total: IntCounter,

    /// Explicit stop requests that removed a worker
    pub stops_total: IntCounter,

    /// Admissions rejected for lack of memory
    pub admission_rejections_total: IntCounter,

    /// Currently registered workers
    pub active_workers: IntGauge,

    /// Sum of the footprints of registered workers
    pub reserved_memory_gb: Gauge,

    /// Time from launch to first healthy response
    pub startup_duration: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry =
        MetricsRegistry::new().expect("static metric definitions are valid");
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let spawns_total = counter(
            &registry,
            "manager_worker_spawns_total",
            "Total number of workers spawned and health-gated",
        )?;
        let spawn_failures_total = counter(
            &registry,
            "manager_worker_spawn_failures_total",
            "Total number of workers that failed to become healthy",
        )?;
        let reuses_total = counter(
            &registry,
            "manager_worker_reuses_total",
            "Total number of ensure calls served by a running worker",
        )?;
        let evictions_total = counter(
            &registry,
            "manager_worker_evictions_total",
            "Total number of workers evicted under memory pressure",
        )?;
        let idle_reaps_total = counter(
            &registry,
            "manager_worker_idle_reaps_total",
            "Total number of workers stopped for being idle",
        )?;
        let dead_reaps_total = counter(
            &registry,
            "manager_worker_dead_reaps_total",
            "Total number of workers removed after exiting on their own",
        )?;
        let stops_total = counter(
            &registry,
            "manager_worker_stops_total",
            "Total number of workers stopped on request",
        )?;
        let admission_rejections_total = counter(
            &registry,
            "manager_admission_rejections_total",
            "Total number of admissions rejected for lack of memory",
        )?;

        let active_workers = IntGauge::new(
            "manager_active_workers",
            "Current number of registered workers",
        )?;
        registry.register(Box::new(active_workers.clone()))?;

        let reserved_memory_gb = Gauge::new(
            "manager_reserved_memory_gb",
            "Sum of footprints of registered workers in GB",
        )?;
        registry.register(Box::new(reserved_memory_gb.clone()))?;

        let startup_duration = Histogram::with_opts(
            HistogramOpts::new(
                "manager_worker_startup_duration_seconds",
                "Time from launch to first healthy response",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 20.0, 30.0, 60.0, 120.0]),
        )?;
        registry.register(Box::new(startup_duration.clone()))?;

        let manager = ManagerMetrics {
            spawns_total,
            spawn_failures_total,
            reuses_total,
            evictions_total,
            idle_reaps_total,
            dead_reaps_total,
            stops_total,
            admission_rejections_total,
            active_workers,
            reserved_memory_gb,
            startup_duration,
        };

        Ok(MetricsRegistry { registry, manager })
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
