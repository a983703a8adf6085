//! Host memory telemetry
//!
//! The registry only ever sees a [`MemorySnapshot`] taken for one admission
//! decision; it never stores one.

use parking_lot::Mutex;
use sysinfo::System;
use tracing::warn;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Point-in-time view of host memory
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemorySnapshot {
    pub total_gb: f64,
    pub used_gb: f64,
    pub available_gb: f64,
}

impl MemorySnapshot {
    /// Build a snapshot from total and available bytes
    pub fn from_bytes(total: u64, available: u64) -> Self {
        let total_gb = total as f64 / BYTES_PER_GB;
        let available_gb = available.min(total) as f64 / BYTES_PER_GB;
        Self {
            total_gb,
            used_gb: total_gb - available_gb,
            available_gb,
        }
    }

    /// Snapshot used when the platform query yields nothing usable
    pub fn fallback() -> Self {
        Self {
            total_gb: 32.0,
            used_gb: 16.0,
            available_gb: 16.0,
        }
    }

    pub fn usage_percent(&self) -> f64 {
        if self.total_gb > 0.0 {
            self.used_gb / self.total_gb * 100.0
        } else {
            0.0
        }
    }

    /// Available memory minus the safety margin. May be negative.
    pub fn headroom_gb(&self, safety_margin_gb: f64) -> f64 {
        self.available_gb - safety_margin_gb
    }
}

/// Source of host memory snapshots
pub trait MemoryOracle: Send + Sync {
    fn snapshot(&self) -> MemorySnapshot;
}

/// Memory oracle backed by `sysinfo`
pub struct SystemMemoryOracle {
    system: Mutex<System>,
}

impl SystemMemoryOracle {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemoryOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOracle for SystemMemoryOracle {
    fn snapshot(&self) -> MemorySnapshot {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total = system.total_memory();
        if total == 0 {
            warn!("Host memory query returned no data, using fallback snapshot");
            return MemorySnapshot::fallback();
        }

        MemorySnapshot::from_bytes(total, system.available_memory())
    }
}
