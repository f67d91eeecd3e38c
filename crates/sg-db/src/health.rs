//! Circuit-breaker health monitor.
//!
//! An external observer of the pool (or any [`HealthSource`]) that writes a
//! separate lock-free flag consumed by upstream authentication middleware.
//! The monitor trips after N consecutive failed observations and restores
//! on the first success; readers never take a lock and never block on the
//! database.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::pool::DbPool;

const HEALTHY: i32 = 1;
const UNHEALTHY: i32 = 0;

/// Anything whose liveness the monitor can observe.
pub trait HealthSource: Send + Sync + 'static {
    fn is_healthy(&self) -> bool;
}

impl HealthSource for DbPool {
    fn is_healthy(&self) -> bool {
        DbPool::is_healthy(self)
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    /// Consecutive failures required to trip the breaker.
    pub failure_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            failure_threshold: 3,
        }
    }
}

/// N-consecutive-failure circuit breaker over a [`HealthSource`].
///
/// The flag starts healthy. Failures increment a counter owned by the
/// single monitor task; reaching the threshold while the flag reads healthy
/// flips it to unhealthy. One success resets the counter and restores the
/// flag. `is_healthy` is a plain atomic load.
pub struct HealthMonitor {
    flag: Arc<AtomicI32>,
    consecutive_failures: Arc<AtomicU32>,
    stop_tx: watch::Sender<bool>,
    task: SyncMutex<Option<JoinHandle<()>>>,
}

impl HealthMonitor {
    /// Spawn the observer task and return the monitor handle.
    pub fn start(source: Arc<dyn HealthSource>, cfg: HealthMonitorConfig) -> Self {
        let flag = Arc::new(AtomicI32::new(HEALTHY));
        let consecutive_failures = Arc::new(AtomicU32::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(monitor_loop(
            source,
            Arc::clone(&flag),
            Arc::clone(&consecutive_failures),
            cfg,
            stop_rx,
        ));

        Self {
            flag,
            consecutive_failures,
            stop_tx,
            task: SyncMutex::new(Some(task)),
        }
    }

    /// Lock-free read of the breaker state.
    pub fn is_healthy(&self) -> bool {
        self.flag.load(Ordering::SeqCst) == HEALTHY
    }

    /// Current consecutive-failure count (observability only).
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Stop and join the observer task. Idempotent.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn monitor_loop(
    source: Arc<dyn HealthSource>,
    flag: Arc<AtomicI32>,
    consecutive_failures: Arc<AtomicU32>,
    cfg: HealthMonitorConfig,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(cfg.check_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Skip the immediate first tick; the breaker starts healthy and the
    // first real observation happens one interval in.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = ticker.tick() => {
                if source.is_healthy() {
                    consecutive_failures.store(0, Ordering::SeqCst);
                    if flag.swap(HEALTHY, Ordering::SeqCst) != HEALTHY {
                        warn!("database health restored; circuit closed");
                    }
                } else {
                    let failures = consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    if failures == 1 {
                        warn!("database health check failed");
                    } else if failures % 3 == 0 {
                        debug!(failures, "database health check still failing");
                    }
                    if failures >= cfg.failure_threshold
                        && flag.swap(UNHEALTHY, Ordering::SeqCst) == HEALTHY
                    {
                        error!(
                            failures,
                            threshold = cfg.failure_threshold,
                            "circuit breaker tripped: marking database unhealthy"
                        );
                    }
                }
            }
        }
    }
}
