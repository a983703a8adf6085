//! Fakes for registry, reaper and API tests

use crate::catalog::{CatalogEntry, ModelCatalog};
use crate::memory::{MemoryOracle, MemorySnapshot};
use crate::process::{
    HealthProbe, LaunchSpec, Launcher, ProcessExit, ProcessHandle, StopSignal, Supervisor,
};
use crate::registry::{RegistrySettings, WorkerRegistry};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use voice_insight_common::config::BackendsConfig;
use voice_insight_common::{BackendKind, Result};

/// Memory oracle returning whatever the test sets
pub struct FakeOracle {
    snapshot: Mutex<MemorySnapshot>,
}

impl FakeOracle {
    pub fn new(available_gb: f64) -> Self {
        Self {
            snapshot: Mutex::new(Self::with_available(available_gb)),
        }
    }

    pub fn set_available(&self, available_gb: f64) {
        *self.snapshot.lock() = Self::with_available(available_gb);
    }

    fn with_available(available_gb: f64) -> MemorySnapshot {
        let total_gb = 64.0_f64.max(available_gb);
        MemorySnapshot {
            total_gb,
            used_gb: total_gb - available_gb,
            available_gb,
        }
    }
}

impl MemoryOracle for FakeOracle {
    fn snapshot(&self) -> MemorySnapshot {
        *self.snapshot.lock()
    }
}

/// How a fake backend behaves once launched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Answers health checks and exits on the first stop signal
    Healthy,

    /// Exits with code 1 before answering any health check
    CrashOnStart,

    /// Stays alive but never answers healthy
    NeverHealthy,

    /// Healthy, but only a forceful signal stops it
    IgnoresGracefulStop,
}

#[derive(Debug)]
struct FakeProcState {
    alias: String,
    port: u16,
    behavior: Behavior,
    exit: Option<ProcessExit>,
}

#[derive(Debug, Default)]
struct HostState {
    scripts: HashMap<String, VecDeque<Behavior>>,
    launches: Vec<LaunchSpec>,
    processes: HashMap<u32, FakeProcState>,
    signals: Vec<(String, StopSignal)>,
    next_pid: u32,
}

/// Fake launcher and health probe sharing one view of "running" processes
#[derive(Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
    startup_delay: Duration,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every health probe takes `delay` before answering
    pub fn with_startup_delay(delay: Duration) -> Self {
        Self {
            startup_delay: delay,
            ..Self::default()
        }
    }

    /// Queue behaviors for the next launches of `alias`; afterwards `Healthy`
    pub fn script(&self, alias: &str, behaviors: &[Behavior]) {
        self.state
            .lock()
            .scripts
            .entry(alias.to_string())
            .or_default()
            .extend(behaviors.iter().copied());
    }

    pub fn launch_count(&self, alias: &str) -> usize {
        self.state
            .lock()
            .launches
            .iter()
            .filter(|spec| spec.alias == alias)
            .count()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state.lock().launches.clone()
    }

    /// Stop signals in the order they were sent
    pub fn signals(&self) -> Vec<(String, StopSignal)> {
        self.state.lock().signals.clone()
    }

    /// Make every live process of `alias` exit on its own
    pub fn crash(&self, alias: &str) {
        let mut state = self.state.lock();
        for process in state.processes.values_mut() {
            if process.alias == alias && process.exit.is_none() {
                process.exit = Some(ProcessExit { code: Some(137) });
            }
        }
    }
}

impl Launcher for FakeHost {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>> {
        let mut state = self.state.lock();
        let behavior = state
            .scripts
            .get_mut(&spec.alias)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Behavior::Healthy);

        state.next_pid += 1;
        let pid = state.next_pid;
        let exit = match behavior {
            Behavior::CrashOnStart => Some(ProcessExit { code: Some(1) }),
            _ => None,
        };
        state.processes.insert(
            pid,
            FakeProcState {
                alias: spec.alias.clone(),
                port: spec.port,
                behavior,
                exit,
            },
        );
        state.launches.push(spec.clone());

        Ok(Box::new(FakeProcess {
            pid,
            state: self.state.clone(),
        }))
    }
}

#[async_trait]
impl HealthProbe for FakeHost {
    async fn is_healthy(&self, url: &str) -> bool {
        if !self.startup_delay.is_zero() {
            tokio::time::sleep(self.startup_delay).await;
        }

        let port = url
            .rsplit(':')
            .next()
            .and_then(|rest| rest.split('/').next())
            .and_then(|port| port.parse::<u16>().ok());

        let state = self.state.lock();
        state.processes.values().any(|process| {
            Some(process.port) == port
                && process.exit.is_none()
                && matches!(process.behavior, Behavior::Healthy | Behavior::IgnoresGracefulStop)
        })
    }
}

#[derive(Debug)]
pub struct FakeProcess {
    pid: u32,
    state: Arc<Mutex<HostState>>,
}

impl FakeProcess {
    fn exit(&self) -> Option<ProcessExit> {
        self.state
            .lock()
            .processes
            .get(&self.pid)
            .and_then(|process| process.exit)
    }
}

#[async_trait]
impl ProcessHandle for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn poll(&mut self) -> Option<ProcessExit> {
        self.exit()
    }

    async fn wait(&mut self) -> Result<ProcessExit> {
        loop {
            if let Some(exit) = self.exit() {
                return Ok(exit);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn signal(&mut self, signal: StopSignal) -> Result<()> {
        let mut state = self.state.lock();
        let Some(process) = state.processes.get_mut(&self.pid) else {
            return Ok(());
        };
        if process.exit.is_some() {
            return Ok(());
        }

        let stops = !(signal == StopSignal::Graceful
            && process.behavior == Behavior::IgnoresGracefulStop);
        if stops {
            process.exit = Some(ProcessExit { code: None });
        }
        let alias = process.alias.clone();
        state.signals.push((alias, signal));
        Ok(())
    }

    async fn captured_output(&mut self) -> String {
        let state = self.state.lock();
        match state.processes.get(&self.pid).map(|process| process.behavior) {
            Some(Behavior::CrashOnStart) => "Traceback (most recent call last):\nRuntimeError: model load failed".to_string(),
            _ => String::new(),
        }
    }
}

pub fn entry(alias: &str, footprint_gb: f64) -> CatalogEntry {
    CatalogEntry {
        alias: alias.to_string(),
        backend_kind: BackendKind::Stt,
        model_path: format!("test/{}", alias),
        footprint_gb,
    }
}

pub fn settings() -> RegistrySettings {
    RegistrySettings {
        safety_margin_gb: 0.0,
        base_port: 9000,
        worker_host: "localhost".to_string(),
        startup_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(300),
        backends: BackendsConfig::default(),
    }
}

/// A registry wired to fakes
pub struct Harness {
    pub registry: Arc<WorkerRegistry>,
    pub host: Arc<FakeHost>,
    pub oracle: Arc<FakeOracle>,
}

pub fn harness(entries: Vec<CatalogEntry>, available_gb: f64) -> Harness {
    harness_with(entries, available_gb, settings(), FakeHost::new())
}

pub fn harness_with(
    entries: Vec<CatalogEntry>,
    available_gb: f64,
    settings: RegistrySettings,
    host: FakeHost,
) -> Harness {
    let host = Arc::new(host);
    let oracle = Arc::new(FakeOracle::new(available_gb));
    let supervisor = Supervisor::new(
        host.clone(),
        host.clone(),
        Duration::from_millis(10),
        Duration::from_millis(100),
    );
    let registry = Arc::new(WorkerRegistry::new(
        ModelCatalog::new(entries),
        oracle.clone(),
        supervisor,
        settings,
    ));

    Harness {
        registry,
        host,
        oracle,
    }
}

/// Serve `app` on an ephemeral loopback port and return its base URL
pub async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}
