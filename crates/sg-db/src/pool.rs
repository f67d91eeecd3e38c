//! Typed wrapper over the PostgreSQL pool.
//!
//! The wrapper adds what the raw pool lacks: an atomic health flag fed by a
//! periodic `SELECT 1` self-check, a mutex-serialized reconnect probe with
//! exponential backoff, fail-fast `acquire` while unhealthy, and an
//! idempotent close that joins its background task before tearing the pool
//! down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::Mutex as SyncMutex;
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use sg_config::DataPlaneConfig;
use sg_types::GateError;

use crate::queries;
use crate::redact::mask_database_url;

/// Budget for each periodic health ping.
const HEALTH_PING_BUDGET: Duration = Duration::from_secs(5);
/// Reconnect backoff starts here and doubles per failed probe.
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Reconnect backoff ceiling.
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
/// How long `close` waits for the health task to finish.
const CLOSE_JOIN_CEILING: Duration = Duration::from_secs(10);

/// Point-in-time pool statistics for operational surfaces.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ConnectionStats {
    pub size: u32,
    pub idle: usize,
    pub max_conns: u32,
    pub healthy: bool,
    pub closed: bool,
}

/// Rate-limited reconnect probe state. Serialized by the pool's mutex so at
/// most one probe is in flight.
struct ReconnectState {
    delay: Duration,
    last_attempt: Option<tokio::time::Instant>,
}

impl ReconnectState {
    fn new() -> Self {
        Self {
            delay: INITIAL_RECONNECT_DELAY,
            last_attempt: None,
        }
    }

    /// Whether a probe may run now; records the attempt time when it may.
    fn attempt_allowed(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        match self.last_attempt {
            Some(t) if now.duration_since(t) < self.delay => false,
            _ => {
                self.last_attempt = Some(now);
                true
            }
        }
    }

    fn record_failure(&mut self) {
        self.delay = next_backoff(self.delay);
    }

    fn reset(&mut self) {
        self.delay = INITIAL_RECONNECT_DELAY;
        self.last_attempt = None;
    }
}

/// `delay * 2`, capped at [`MAX_RECONNECT_DELAY`].
fn next_backoff(delay: Duration) -> Duration {
    (delay * 2).min(MAX_RECONNECT_DELAY)
}

/// Shared handle to the PostgreSQL pool plus its health machinery.
///
/// Constructed once via [`DbPool::connect`] and passed around as
/// `Arc<DbPool>`. The pool owns exactly one background task (the health
/// loop); `close` stops and joins it.
pub struct DbPool {
    pool: PgPool,
    healthy: AtomicBool,
    closed: AtomicBool,
    reconnect: Mutex<ReconnectState>,
    stop_tx: watch::Sender<bool>,
    health_task: SyncMutex<Option<JoinHandle<()>>>,
    max_conns: u32,
    connect_timeout: Duration,
    health_interval: Duration,
}

impl DbPool {
    /// Parse the DSN, build the pool, and verify connectivity with one ping
    /// inside `connect_timeout`. Any failure here aborts startup.
    pub async fn connect(cfg: &DataPlaneConfig) -> Result<Arc<Self>, GateError> {
        if cfg.database_url.trim().is_empty() {
            return Err(GateError::ConnectionFailed(
                "database_url is empty".to_string(),
            ));
        }

        let opts: PgConnectOptions = cfg
            .database_url
            .parse()
            .map_err(|e| GateError::ConnectionFailed(format!("invalid database url: {e}")))?;

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_conns)
            .min_connections(cfg.effective_min_conns())
            .acquire_timeout(cfg.connect_timeout())
            .connect_lazy_with(opts);

        ping(&pool, cfg.connect_timeout())
            .await
            .map_err(GateError::connection)?;

        info!(
            url = %mask_database_url(&cfg.database_url),
            max_conns = cfg.max_conns,
            min_conns = cfg.effective_min_conns(),
            "connected to postgres"
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let db = Arc::new(Self {
            pool,
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            reconnect: Mutex::new(ReconnectState::new()),
            stop_tx,
            health_task: SyncMutex::new(None),
            max_conns: cfg.max_conns,
            connect_timeout: cfg.connect_timeout(),
            health_interval: cfg.health_check_interval(),
        });

        let handle = tokio::spawn(Self::health_loop(Arc::clone(&db), stop_rx));
        *db.health_task.lock() = Some(handle);

        Ok(db)
    }

    /// Lock-free health read. A closed pool is never healthy.
    pub fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.healthy.load(Ordering::SeqCst)
    }

    /// Check out a connection, refusing immediately while the pool is
    /// closed or unhealthy so callers fail fast instead of queueing on a
    /// dead database.
    pub async fn acquire(&self) -> Result<PoolConnection<Postgres>, GateError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GateError::ConnectionFailed(
                "connection pool is closed".to_string(),
            ));
        }
        if !self.healthy.load(Ordering::SeqCst) {
            return Err(GateError::ConnectionFailed(
                "connection pool is unhealthy".to_string(),
            ));
        }
        self.pool.acquire().await.map_err(GateError::connection)
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max_conns: self.max_conns,
            healthy: self.is_healthy(),
            closed: self.closed.load(Ordering::SeqCst),
        }
    }

    /// Stop the health loop and close the underlying pool.
    ///
    /// Single-shot via compare-and-swap: the second and later calls return
    /// immediately. Waits up to 10 s for the background task.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(true);

        let handle = self.health_task.lock().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(CLOSE_JOIN_CEILING, handle).await.is_err() {
                warn!("health loop did not stop within close ceiling");
            }
        }

        self.pool.close().await;
        info!("connection pool closed");
    }

    fn mark_healthy(&self) {
        if !self.healthy.swap(true, Ordering::SeqCst) {
            info!("database connection restored");
        }
    }

    fn mark_unhealthy(&self, err: &anyhow::Error) {
        if self.healthy.swap(false, Ordering::SeqCst) {
            warn!(error = %err, "database health check failed; marking pool unhealthy");
        } else {
            debug!(error = %err, "database still unhealthy");
        }
    }

    async fn health_loop(this: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(this.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; connectivity was just verified.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {
                    match ping(&this.pool, HEALTH_PING_BUDGET).await {
                        Ok(()) => {
                            this.mark_healthy();
                            this.reconnect.lock().await.reset();
                        }
                        Err(err) => {
                            this.mark_unhealthy(&err);
                            this.try_reconnect().await;
                        }
                    }
                }
            }
        }
    }

    /// One rate-limited reconnect probe. The mutex keeps a single probe in
    /// flight; the backoff delay gates how often one may start.
    async fn try_reconnect(&self) {
        let mut state = self.reconnect.lock().await;
        if !state.attempt_allowed() {
            debug!(delay = ?state.delay, "reconnect suppressed by backoff");
            return;
        }
        match ping(&self.pool, self.connect_timeout).await {
            Ok(()) => {
                state.reset();
                self.mark_healthy();
            }
            Err(err) => {
                state.record_failure();
                warn!(
                    error = %err,
                    next_delay = ?state.delay,
                    "reconnect probe failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("healthy", &self.healthy.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .field("size", &self.pool.size())
            .finish()
    }
}

/// `SELECT 1` with a deadline.
async fn ping(pool: &PgPool, budget: Duration) -> anyhow::Result<()> {
    tokio::time::timeout(budget, sqlx::query(queries::PING).execute(pool))
        .await
        .context("database ping timed out")?
        .context("database ping failed")?;
    Ok(())
}

#[cfg(feature = "testkit")]
impl DbPool {
    /// A pool wired to a non-routable address and reported unhealthy from
    /// the start. Lets failure-path tests exercise refusal and retry logic
    /// without a live database.
    pub fn disconnected() -> Arc<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_millis(100))
            .connect_lazy("postgres://sg:sg@127.0.0.1:1/sg")
            .expect("lazy pool construction");
        let (stop_tx, _stop_rx) = watch::channel(false);
        Arc::new(Self {
            pool,
            healthy: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            reconnect: Mutex::new(ReconnectState::new()),
            stop_tx,
            health_task: SyncMutex::new(None),
            max_conns: 1,
            connect_timeout: Duration::from_millis(100),
            health_interval: Duration::from_secs(10),
        })
    }

    /// Force the health flag, bypassing the health loop.
    pub fn force_health(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let mut d = INITIAL_RECONNECT_DELAY;
        let mut seen = Vec::new();
        for _ in 0..7 {
            d = next_backoff(d);
            seen.push(d.as_secs());
        }
        assert_eq!(seen, vec![2, 4, 8, 16, 30, 30, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_attempts_rate_limited_by_delay() {
        let mut st = ReconnectState::new();
        assert!(st.attempt_allowed());
        st.record_failure();
        // Inside the 2 s window: suppressed.
        assert!(!st.attempt_allowed());
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(st.attempt_allowed());
        st.reset();
        assert_eq!(st.delay, INITIAL_RECONNECT_DELAY);
    }
}
