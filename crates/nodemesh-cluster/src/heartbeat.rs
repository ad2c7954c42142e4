//! Failure detection tasks
//!
//! Two periodic tasks run while a [`ClusterManager`] is started:
//!
//! - the **scanner** (every heartbeat interval) marks nodes whose last
//!   heartbeat is older than the heartbeat timeout as `Offline`
//! - the **reaper** (every 2 × timeout) evicts nodes silent for more than
//!   3 × timeout
//!
//! Both tasks hold only a weak reference to the manager and exit on their own
//! once it is dropped.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::manager::{ClusterManager, WeakClusterManager};

/// Multiplier of the heartbeat timeout after which a node is evicted.
pub const EVICTION_FACTOR: u32 = 3;

/// Multiplier of the heartbeat timeout between two reaper runs.
pub const REAPER_PERIOD_FACTOR: u32 = 2;

/// Handles to the running scanner and reaper.
pub(crate) struct HeartbeatTasks {
    shutdown: watch::Sender<bool>,
    scanner: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl HeartbeatTasks {
    /// Spawns both tasks on the current runtime.
    pub(crate) fn spawn(manager: &ClusterManager, interval: Duration, timeout: Duration) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);

        let scanner = spawn_periodic(
            "heartbeat scanner",
            manager.downgrade(),
            interval,
            shutdown_rx.clone(),
            |manager| {
                manager.scan_heartbeats();
            },
        );

        let reaper = spawn_periodic(
            "dead node reaper",
            manager.downgrade(),
            timeout * REAPER_PERIOD_FACTOR,
            shutdown_rx,
            |manager| {
                manager.reap_dead_nodes();
            },
        );

        Self {
            shutdown,
            scanner,
            reaper,
        }
    }

    /// Signals both tasks and waits up to `grace` for them to finish.
    ///
    /// Tasks still running after the grace period are aborted. Returns
    /// `false` in that case.
    pub(crate) async fn shutdown(self, grace: Duration) -> bool {
        let _ = self.shutdown.send(true);

        let scanner_abort = self.scanner.abort_handle();
        let reaper_abort = self.reaper.abort_handle();

        let joined = tokio::time::timeout(grace, async {
            let _ = self.scanner.await;
            let _ = self.reaper.await;
        })
        .await;

        if joined.is_err() {
            warn!(
                "Heartbeat tasks did not stop within {}ms, forcing shutdown",
                grace.as_millis()
            );
            scanner_abort.abort();
            reaper_abort.abort();
            return false;
        }
        true
    }
}

fn spawn_periodic<F>(
    name: &'static str,
    manager: WeakClusterManager,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn(&ClusterManager) + Send + 'static,
{
    tokio::spawn(async move {
        // First run one period after start
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    tick(&manager);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("{} stopped", name);
    })
}
