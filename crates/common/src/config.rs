//! Configuration structures for Voice Insight
//!
//! This module defines the static configuration document read by the worker
//! manager. Configurations are loaded from YAML files and a handful of scalar
//! settings can be overridden by environment variables.

use crate::error::{ManagerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration for the worker manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Model catalog, keyed by alias
    pub models: BTreeMap<String, ModelConfig>,

    /// Memory budget
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Worker lifecycle and listener settings
    #[serde(default)]
    pub workers: WorkersConfig,

    /// How each backend kind is launched
    #[serde(default)]
    pub backends: BackendsConfig,

    /// Observability configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

/// Kind of inference backend behind an alias
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Speech-to-text
    Stt,

    /// Text-to-speech
    Tts,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Stt => "stt",
            BackendKind::Tts => "tts",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single model catalog entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Backend kind ("stt" or "tts")
    #[serde(rename = "type")]
    pub kind: BackendKind,

    /// Model path handed to the backend (usually a HuggingFace repo id)
    pub path: String,

    /// Model parameters. Only `memory_gb` is read by the manager.
    #[serde(default)]
    pub params: ModelParams,
}

/// Per-model parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelParams {
    /// Pre-measured memory footprint; estimated from the path when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_gb: Option<f64>,
}

/// Memory budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Memory kept free on top of every admission
    #[serde(default = "default_safety_margin")]
    pub safety_margin_gb: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            safety_margin_gb: default_safety_margin(),
        }
    }
}

/// Worker lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Address the manager API binds to
    #[serde(default = "default_manager_host")]
    pub manager_host: String,

    /// Port the manager API binds to
    #[serde(default = "default_manager_port")]
    pub manager_port: u16,

    /// Host clients reach the manager API at
    #[serde(default = "default_manager_client_host")]
    pub manager_client_host: String,

    /// Host spawned workers are reached at
    #[serde(default = "default_worker_host")]
    pub worker_host: String,

    /// First port handed to a spawned worker
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Idle time after which a worker is reaped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,

    /// Interval between idle reaper sweeps, in seconds
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,

    /// Maximum time a worker may take to answer its first health check
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,

    /// Interval between health polls while a worker starts
    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,

    /// Time allowed between the graceful and the forceful stop signal
    #[serde(default = "default_termination_grace")]
    pub termination_grace_seconds: u64,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            manager_host: default_manager_host(),
            manager_port: default_manager_port(),
            manager_client_host: default_manager_client_host(),
            worker_host: default_worker_host(),
            base_port: default_base_port(),
            idle_timeout_seconds: default_idle_timeout(),
            health_check_interval: default_health_check_interval(),
            startup_timeout: default_startup_timeout(),
            health_poll_interval_ms: default_health_poll_interval(),
            termination_grace_seconds: default_termination_grace(),
        }
    }
}

/// Launch commands per backend kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    #[serde(default = "default_stt_command")]
    pub stt: BackendCommand,

    #[serde(default = "default_tts_command")]
    pub tts: BackendCommand,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            stt: default_stt_command(),
            tts: default_tts_command(),
        }
    }
}

impl BackendsConfig {
    /// Launch command for a backend kind
    pub fn for_kind(&self, kind: BackendKind) -> &BackendCommand {
        match kind {
            BackendKind::Stt => &self.stt,
            BackendKind::Tts => &self.tts,
        }
    }
}

/// Program, leading arguments and extra environment of a backend.
///
/// `--alias`, `--model_path` and `--port` are appended by the manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendCommand {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub structured_logging: bool,

    /// Serve Prometheus metrics on /metrics
    #[serde(default = "default_metrics")]
    pub enable_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            structured_logging: false,
            enable_metrics: default_metrics(),
        }
    }
}

/// Default value functions
fn default_safety_margin() -> f64 {
    2.0
}

fn default_manager_host() -> String {
    "0.0.0.0".to_string()
}

fn default_manager_port() -> u16 {
    8210
}

fn default_manager_client_host() -> String {
    "localhost".to_string()
}

fn default_worker_host() -> String {
    "localhost".to_string()
}

fn default_base_port() -> u16 {
    8211
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_startup_timeout() -> u64 {
    120
}

fn default_health_poll_interval() -> u64 {
    500
}

fn default_termination_grace() -> u64 {
    5
}

fn python_backend(module: &str) -> BackendCommand {
    BackendCommand {
        program: "python3".to_string(),
        args: vec!["-m".to_string(), module.to_string()],
        env: BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "1".to_string())]),
    }
}

fn default_stt_command() -> BackendCommand {
    python_backend("src.workers.stt_worker")
}

fn default_tts_command() -> BackendCommand {
    python_backend("src.workers.tts_worker")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics() -> bool {
    true
}

impl ManagerConfig {
    /// Load configuration from a YAML file, apply environment overrides and
    /// validate the result
    pub fn from_file<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ManagerError::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;

        let mut config = Self::from_yaml(&content)
            .map_err(|e| ManagerError::Config(format!("Failed to parse config file {}: {}", path.display(), e)))?;

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document without overrides or validation
    pub fn from_yaml(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("MANAGER_HOST") {
            self.workers.manager_host = host;
        }
        if let Some(port) = lookup("MANAGER_PORT") {
            self.workers.manager_port = parse_override("MANAGER_PORT", &port)?;
        }
        if let Some(host) = lookup("WORKER_MANAGER_HOST") {
            self.workers.manager_client_host = host;
        }
        if let Some(host) = lookup("WORKER_HOST") {
            self.workers.worker_host = host;
        }
        if let Some(port) = lookup("BASE_PORT") {
            self.workers.base_port = parse_override("BASE_PORT", &port)?;
        }
        if let Some(timeout) = lookup("IDLE_TIMEOUT") {
            self.workers.idle_timeout_seconds = parse_override("IDLE_TIMEOUT", &timeout)?;
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(ManagerError::config("At least one model must be configured"));
        }

        for (alias, model) in &self.models {
            if model.path.trim().is_empty() {
                return Err(ManagerError::config(format!("Model {} has an empty path", alias)));
            }
            if let Some(memory_gb) = model.params.memory_gb {
                if !memory_gb.is_finite() || memory_gb <= 0.0 {
                    return Err(ManagerError::config(format!(
                        "Model {} has an invalid memory_gb: {}",
                        alias, memory_gb
                    )));
                }
            }
        }

        let margin = self.memory.safety_margin_gb;
        if !margin.is_finite() || margin < 0.0 {
            return Err(ManagerError::config(format!("Invalid safety_margin_gb: {}", margin)));
        }

        let workers = &self.workers;
        if workers.base_port == 0 {
            return Err(ManagerError::config("base_port must be non-zero"));
        }
        for (name, value) in [
            ("idle_timeout_seconds", workers.idle_timeout_seconds),
            ("health_check_interval", workers.health_check_interval),
            ("startup_timeout", workers.startup_timeout),
            ("health_poll_interval_ms", workers.health_poll_interval_ms),
            ("termination_grace_seconds", workers.termination_grace_seconds),
        ] {
            if value == 0 {
                return Err(ManagerError::config(format!("{} must be greater than zero", name)));
            }
        }

        for (kind, command) in [
            (BackendKind::Stt, &self.backends.stt),
            (BackendKind::Tts, &self.backends.tts),
        ] {
            if command.program.trim().is_empty() {
                return Err(ManagerError::config(format!("Backend {} has an empty program", kind)));
            }
        }

        Ok(())
    }

    /// Observability settings, defaulted when the section is absent
    pub fn observability(&self) -> ObservabilityConfig {
        self.observability.clone().unwrap_or_default()
    }
}

impl WorkersConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_seconds)
    }

    /// Address the manager API listens on
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.manager_host, self.manager_port)
    }

    /// Base URL clients reach the manager API at
    pub fn manager_url(&self) -> String {
        format!("http://{}:{}", self.manager_client_host, self.manager_port)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ManagerError::Config(format!("Invalid value for {}: {:?}", key, value)))
}
