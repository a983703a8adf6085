//! Periodic idle-worker reaper

use crate::registry::WorkerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Sweep `registry` every `interval` until the returned task is aborted.
/// The first sweep happens one full interval after startup.
pub fn spawn_idle_reaper(registry: Arc<WorkerRegistry>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        info!(interval_secs = interval.as_secs(), "Idle reaper started");

        loop {
            ticker.tick().await;

            let report = registry.sweep().await;
            if report.is_empty() {
                debug!(workers = registry.len(), "Reaper sweep found nothing to reap");
            } else {
                info!(
                    idle = ?report.idle,
                    dead = ?report.dead,
                    "Reaper removed {} worker(s)",
                    report.idle.len() + report.dead.len()
                );
            }
        }
    })
}
