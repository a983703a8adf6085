//! Voice Insight manager protocol
//!
//! JSON bodies exchanged over the worker manager's HTTP API. The server in
//! `voice-insight-manager` produces them and its client consumes them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    pub fn healthy() -> Self {
        Self {
            status: "healthy".to_string(),
        }
    }
}

/// `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub memory: MemoryStatus,
    pub workers: BTreeMap<String, WorkerStatus>,
}

/// Host memory at the time of the status call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryStatus {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
    pub usage_percent: f64,
}

/// One live worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerStatus {
    pub port: u16,
    pub model_path: String,
    pub model_type: String,
    pub memory_gb: f64,
    pub uptime_seconds: u64,
    pub idle_seconds: u64,
    pub request_count: u64,
}

/// `POST /spawn/{alias}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpawnResponse {
    pub alias: String,
    pub port: u16,
    pub memory_gb: f64,
    pub model_type: String,
}

/// `POST /touch/{alias}`, `POST /stop/{alias}`, `POST /stop-all`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SuccessResponse {
    pub success: bool,
}

impl SuccessResponse {
    pub fn new(success: bool) -> Self {
        Self { success }
    }
}

/// Error body for any non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorResponse {
    pub detail: String,
}
