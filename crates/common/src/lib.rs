//! Voice Insight common library
//!
//! This crate contains shared code used by the worker manager and its clients.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::{BackendCommand, BackendKind, ManagerConfig};
pub use error::{ManagerError, Result};
pub use metrics::{MetricsRegistry, METRICS};
