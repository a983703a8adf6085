//! Voice Insight worker manager
//!
//! Keeps inference backends running as child processes on one host, admits
//! new ones only when host memory allows, evicts the least recently used ones
//! when it does not, and reaps idle ones.

pub mod api;
pub mod catalog;
pub mod client;
pub mod memory;
pub mod process;
pub mod reaper;
pub mod registry;

#[cfg(test)]
mod testing;

pub use catalog::{CatalogEntry, ModelCatalog};
pub use client::{ManagerClient, WorkerEndpoint};
pub use memory::{MemoryOracle, MemorySnapshot, SystemMemoryOracle};
pub use process::{HttpHealthProbe, OsLauncher, Supervisor};
pub use reaper::spawn_idle_reaper;
pub use registry::{RegistrySettings, RegistryStatus, WorkerInfo, WorkerRegistry};
