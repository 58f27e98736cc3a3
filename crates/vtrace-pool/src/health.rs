//! Periodic worker health monitoring.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::pool::WorkerPool;

/// Spawn the health sweep loop.
///
/// Pings idle workers every `health_interval` and replaces the dead ones.
/// The loop exits when `shutdown` flips to `true`.
pub fn spawn_health_loop(
    pool: Arc<WorkerPool>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let interval = pool.config().health_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a fresh pool is
        // not swept before it has done any work.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health loop shutting down");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    pool.health_check().await;
                }
            }
        }
    })
}
