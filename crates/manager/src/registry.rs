//! Worker registry
//!
//! This module owns every running backend process and implements the
//! memory-aware admission policy: reuse a running worker, otherwise evict the
//! least recently used ready workers until the new footprint fits, then spawn
//! and health-gate the new one.
//!
//! Admission, eviction, explicit stops and reaper sweeps are serialized by one
//! async mutex, which is held across a spawn and its health gate so that two
//! concurrent requests for the same alias never spawn twice. The alias map
//! sits behind a separate short-lived lock and only ever receives records that
//! passed their health gate, so `touch` and status reads never observe a
//! record under construction.

use crate::catalog::{CatalogEntry, ModelCatalog};
use crate::memory::{MemoryOracle, MemorySnapshot};
use crate::process::{GateFailure, LaunchSpec, ProcessHandle, Supervisor};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use voice_insight_common::config::{BackendsConfig, ManagerConfig};
use voice_insight_common::{BackendKind, ManagerError, Result, METRICS};

/// Registry tuning, derived from the configuration document
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub safety_margin_gb: f64,
    pub base_port: u16,
    /// Host the manager reaches spawned workers at
    pub worker_host: String,
    pub startup_timeout: Duration,
    pub idle_timeout: Duration,
    pub backends: BackendsConfig,
}

impl RegistrySettings {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            safety_margin_gb: config.memory.safety_margin_gb,
            base_port: config.workers.base_port,
            worker_host: config.workers.worker_host.clone(),
            startup_timeout: config.workers.startup_timeout(),
            idle_timeout: config.workers.idle_timeout(),
            backends: config.backends.clone(),
        }
    }
}

/// Lifecycle state of a worker record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Launched, health gate not yet passed
    Starting,

    /// Health-gated and serving
    Ready,

    /// Process exited; about to be removed
    Dead,
}

/// One running backend. Owns its process exclusively.
#[derive(Debug)]
struct WorkerRecord {
    alias: String,
    process: Box<dyn ProcessHandle>,
    port: u16,
    model_path: String,
    backend_kind: BackendKind,
    memory_footprint_gb: f64,
    started_at: Instant,
    last_used_at: Instant,
    request_count: u64,
    readiness: Readiness,
}

impl WorkerRecord {
    fn starting(entry: &CatalogEntry, port: u16, process: Box<dyn ProcessHandle>) -> Self {
        let now = Instant::now();
        Self {
            alias: entry.alias.clone(),
            process,
            port,
            model_path: entry.model_path.clone(),
            backend_kind: entry.backend_kind,
            memory_footprint_gb: entry.footprint_gb,
            started_at: now,
            last_used_at: now,
            request_count: 0,
            readiness: Readiness::Starting,
        }
    }

    fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            alias: self.alias.clone(),
            port: self.port,
            model_path: self.model_path.clone(),
            backend_kind: self.backend_kind,
            footprint_gb: self.memory_footprint_gb,
            readiness: self.readiness,
        }
    }

    fn summary(&self, now: Instant) -> WorkerSummary {
        WorkerSummary {
            alias: self.alias.clone(),
            port: self.port,
            model_path: self.model_path.clone(),
            backend_kind: self.backend_kind,
            footprint_gb: self.memory_footprint_gb,
            uptime: now.saturating_duration_since(self.started_at),
            idle_time: self.idle_time(now),
            request_count: self.request_count,
        }
    }
}

/// A worker as handed to callers of [`WorkerRegistry::ensure`]
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerInfo {
    pub alias: String,
    pub port: u16,
    pub model_path: String,
    pub backend_kind: BackendKind,
    pub footprint_gb: f64,
    pub readiness: Readiness,
}

/// Point-in-time view of one live worker
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSummary {
    pub alias: String,
    pub port: u16,
    pub model_path: String,
    pub backend_kind: BackendKind,
    pub footprint_gb: f64,
    pub uptime: Duration,
    pub idle_time: Duration,
    pub request_count: u64,
}

/// Memory snapshot plus every live worker, sorted by alias
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryStatus {
    pub memory: MemorySnapshot,
    pub workers: Vec<WorkerSummary>,
}

/// Aliases removed by one reaper sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle longer than the idle timeout
    pub idle: Vec<String>,

    /// Process had already exited
    pub dead: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.idle.is_empty() && self.dead.is_empty()
    }
}

/// A ready worker that may be evicted
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub alias: String,
    pub last_used_at: Instant,
    pub footprint_gb: f64,
}

/// Least recently used first, ties broken by alias
pub fn eviction_order(mut candidates: Vec<EvictionCandidate>) -> Vec<EvictionCandidate> {
    candidates.sort_by(|a, b| {
        a.last_used_at
            .cmp(&b.last_used_at)
            .then_with(|| a.alias.cmp(&b.alias))
    });
    candidates
}

/// Monotonic port counter. Freed ports are never handed out again.
#[derive(Debug)]
struct PortAllocator {
    next: Option<u16>,
}

impl PortAllocator {
    fn new(base_port: u16) -> Self {
        Self {
            next: Some(base_port),
        }
    }

    fn check_available(&self) -> Result<u16> {
        self.next
            .ok_or_else(|| ManagerError::resource_exhausted("Worker port range exhausted"))
    }

    fn allocate(&mut self) -> Result<u16> {
        let port = self.check_available()?;
        self.next = port.checked_add(1);
        Ok(port)
    }
}

/// Registry of running workers
pub struct WorkerRegistry {
    catalog: ModelCatalog,
    oracle: Arc<dyn MemoryOracle>,
    supervisor: Supervisor,
    settings: RegistrySettings,

    /// Exclusive section for admission, eviction, stop and sweeps. Guards the
    /// port counter.
    admission: Mutex<PortAllocator>,

    workers: RwLock<HashMap<String, WorkerRecord>>,
}

impl WorkerRegistry {
    /// Create a new registry
    pub fn new(
        catalog: ModelCatalog,
        oracle: Arc<dyn MemoryOracle>,
        supervisor: Supervisor,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            catalog,
            oracle,
            supervisor,
            admission: Mutex::new(PortAllocator::new(settings.base_port)),
            settings,
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Return the running worker for `alias`, spawning it if needed
    pub async fn ensure(&self, alias: &str) -> Result<WorkerInfo> {
        if let Some(info) = self.reuse(alias) {
            return Ok(info);
        }

        let entry = self.catalog.get(alias)?.clone();
        let mut ports = self.admission.lock().await;

        // Another caller may have finished spawning it while we waited
        if let Some(info) = self.reuse(alias) {
            return Ok(info);
        }

        // Nothing is evicted for an admission that could never get a port
        ports.check_available()?;
        self.make_room(&entry).await?;
        let port = ports.allocate()?;
        let record = self.start_worker(&entry, port).await?;
        let info = record.info();

        self.workers.write().insert(entry.alias.clone(), record);
        self.update_gauges();
        Ok(info)
    }

    /// Record a dispatched request. Returns false if `alias` is not running.
    pub fn touch(&self, alias: &str) -> bool {
        let mut workers = self.workers.write();
        match workers.get_mut(alias) {
            Some(record) => {
                record.last_used_at = Instant::now();
                record.request_count += 1;
                true
            }
            None => false,
        }
    }

    /// Stop a worker. Returns false, with no side effects, if none is running.
    ///
    /// The record is removed before its process is terminated, so the alias
    /// can be spawned again while the old process drains.
    pub async fn stop(&self, alias: &str) -> bool {
        let removed = {
            let _admission = self.admission.lock().await;
            let removed = self.workers.write().remove(alias);
            removed
        };

        let Some(record) = removed else {
            debug!(alias, "Stop requested for a worker that is not running");
            return false;
        };

        METRICS.manager.stops_total.inc();
        self.update_gauges();
        info!(alias, port = record.port, "Stopping worker");
        self.shutdown(record).await;
        true
    }

    /// Stop every running worker. Returns how many were stopped.
    pub async fn stop_all(&self) -> usize {
        let mut removed: Vec<WorkerRecord> = {
            let _admission = self.admission.lock().await;
            let drained: Vec<WorkerRecord> = self
                .workers
                .write()
                .drain()
                .map(|(_, record)| record)
                .collect();
            drained
        };
        removed.sort_by(|a, b| a.alias.cmp(&b.alias));

        let count = removed.len();
        METRICS.manager.stops_total.inc_by(count as u64);
        self.update_gauges();
        for record in removed {
            info!(alias = %record.alias, port = record.port, "Stopping worker");
            self.shutdown(record).await;
        }
        count
    }

    /// Current memory snapshot and every live worker
    pub fn snapshot_status(&self) -> RegistryStatus {
        let memory = self.oracle.snapshot();
        let now = Instant::now();
        let mut workers: Vec<WorkerSummary> = self
            .workers
            .read()
            .values()
            .map(|record| record.summary(now))
            .collect();
        workers.sort_by(|a, b| a.alias.cmp(&b.alias));

        RegistryStatus { memory, workers }
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.workers.read().contains_key(alias)
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Reap idle and dead workers as of now
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now()).await
    }

    /// Reap workers idle for longer than the idle timeout at `now`, and
    /// workers whose process has already exited. Failures to terminate one
    /// worker are logged and do not stop the sweep.
    pub async fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        let expired: Vec<WorkerRecord> = {
            let _admission = self.admission.lock().await;
            let mut workers = self.workers.write();

            let mut aliases = Vec::new();
            for (alias, record) in workers.iter_mut() {
                if let Some(exit) = record.process.poll() {
                    record.readiness = Readiness::Dead;
                    warn!(alias = %alias, port = record.port, "Worker {} on its own, removing", exit);
                    report.dead.push(alias.clone());
                    aliases.push(alias.clone());
                } else if record.readiness == Readiness::Ready
                    && record.idle_time(now) > self.settings.idle_timeout
                {
                    info!(
                        alias = %alias,
                        idle_secs = record.idle_time(now).as_secs(),
                        "Evicting idle worker"
                    );
                    report.idle.push(alias.clone());
                    aliases.push(alias.clone());
                }
            }

            let expired: Vec<WorkerRecord> = aliases
                .iter()
                .filter_map(|alias| workers.remove(alias))
                .collect();
            expired
        };

        if expired.is_empty() {
            return report;
        }

        report.idle.sort();
        report.dead.sort();
        METRICS.manager.idle_reaps_total.inc_by(report.idle.len() as u64);
        METRICS.manager.dead_reaps_total.inc_by(report.dead.len() as u64);
        self.update_gauges();

        for record in expired {
            self.shutdown(record).await;
        }
        report
    }

    fn reuse(&self, alias: &str) -> Option<WorkerInfo> {
        let mut workers = self.workers.write();
        let record = workers.get_mut(alias)?;
        record.last_used_at = Instant::now();
        METRICS.manager.reuses_total.inc();
        debug!(alias, port = record.port, "Reusing running worker");
        Some(record.info())
    }

    /// Evict least recently used ready workers until `entry` fits in the
    /// headroom. Must be called inside the admission section.
    async fn make_room(&self, entry: &CatalogEntry) -> Result<()> {
        let needed = entry.footprint_gb;
        let mut headroom = self
            .oracle
            .snapshot()
            .headroom_gb(self.settings.safety_margin_gb);

        if headroom >= needed {
            return Ok(());
        }

        info!(
            alias = %entry.alias,
            needed_gb = needed,
            headroom_gb = headroom,
            "Not enough headroom, evicting least recently used workers"
        );

        for candidate in eviction_order(self.eviction_candidates()) {
            if headroom >= needed {
                break;
            }

            let removed = self.workers.write().remove(&candidate.alias);
            let Some(record) = removed else {
                continue;
            };

            headroom += record.memory_footprint_gb;
            METRICS.manager.evictions_total.inc();
            self.update_gauges();
            info!(
                alias = %record.alias,
                footprint_gb = record.memory_footprint_gb,
                headroom_gb = headroom,
                "Evicting worker for memory"
            );
            self.shutdown(record).await;
        }

        if headroom < needed {
            METRICS.manager.admission_rejections_total.inc();
            return Err(ManagerError::resource_exhausted(format!(
                "{} needs {:.2} GB but only {:.2} GB of headroom remains after evicting every idle worker",
                entry.alias, needed, headroom
            )));
        }

        Ok(())
    }

    fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        self.workers
            .read()
            .values()
            .filter(|record| record.readiness == Readiness::Ready)
            .map(|record| EvictionCandidate {
                alias: record.alias.clone(),
                last_used_at: record.last_used_at,
                footprint_gb: record.memory_footprint_gb,
            })
            .collect()
    }

    /// Launch and health-gate a worker. On failure the process is terminated
    /// and nothing is registered.
    async fn start_worker(&self, entry: &CatalogEntry, port: u16) -> Result<WorkerRecord> {
        let command = self.settings.backends.for_kind(entry.backend_kind);
        let spec = LaunchSpec::for_worker(command, &entry.alias, &entry.model_path, port);

        let process = self.supervisor.launch(&spec).map_err(|e| {
            METRICS.manager.spawn_failures_total.inc();
            e
        })?;
        let mut record = WorkerRecord::starting(entry, port, process);

        let health_url = format!("http://{}:{}/health", self.settings.worker_host, port);
        info!(
            alias = %entry.alias,
            port,
            footprint_gb = entry.footprint_gb,
            "Waiting for worker to become healthy"
        );

        match self
            .supervisor
            .health_gate(record.process.as_mut(), &health_url, self.settings.startup_timeout)
            .await
        {
            Ok(elapsed) => {
                record.readiness = Readiness::Ready;
                record.last_used_at = Instant::now();
                METRICS.manager.spawns_total.inc();
                METRICS.manager.startup_duration.observe(elapsed.as_secs_f64());
                info!(
                    alias = %entry.alias,
                    port,
                    pid = ?record.process.pid(),
                    "Worker ready after {:.1}s",
                    elapsed.as_secs_f64()
                );
                Ok(record)
            }
            Err(failure) => {
                METRICS.manager.spawn_failures_total.inc();
                record.readiness = Readiness::Dead;
                if let Err(e) = self.supervisor.terminate(record.process.as_mut()).await {
                    warn!(alias = %entry.alias, "Failed to terminate worker after startup failure: {}", e);
                }

                let output = match &failure {
                    GateFailure::Exited { output, .. } => output.clone(),
                    GateFailure::TimedOut { .. } => record.process.captured_output().await,
                };
                warn!(alias = %entry.alias, port, "Worker failed to start: {}", failure);
                Err(ManagerError::startup_failure(&entry.alias, failure.to_string(), output))
            }
        }
    }

    /// Single termination path for stop, eviction and reaping
    async fn shutdown(&self, mut record: WorkerRecord) {
        if let Err(e) = self.supervisor.terminate(record.process.as_mut()).await {
            warn!(alias = %record.alias, port = record.port, "Failed to terminate worker: {}", e);
            return;
        }
        info!(alias = %record.alias, port = record.port, "Worker stopped");
    }

    fn update_gauges(&self) {
        let workers = self.workers.read();
        METRICS.manager.active_workers.set(workers.len() as i64);
        METRICS
            .manager
            .reserved_memory_gb
            .set(workers.values().map(|record| record.memory_footprint_gb).sum());
    }
}
