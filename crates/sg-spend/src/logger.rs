//! Asynchronous, durable spend logging.
//!
//! One bounded queue feeds one batch worker. Flushes are transactional:
//! the multi-row insert and the six per-level spend-delta updates commit or
//! roll back together, and the `RETURNING` set filters retried duplicates
//! out of the delta computation so a partially-successful earlier attempt
//! is never double-counted. Batches that exhaust the retry ladder land in
//! the dead-letter queue; a recovery worker replays them every five
//! minutes and once at shutdown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sqlx::{Acquire, Postgres, Transaction};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sg_config::DataPlaneConfig;
use sg_db::{queries, DbPool};
use sg_types::{GateError, SpendLogEntry};

use crate::aggregate::{AggregationScheduler, AggregationStats, DEFAULT_SAFETY_NET_INTERVAL};
use crate::dlq::{DeadLetterBatch, DeadLetterQueue};
use crate::updates::{aggregate_spend_updates, split_composite_key, SpendUpdates};

/// Backoff before each flush attempt: the first attempt runs immediately,
/// later ones wait progressively longer.
pub const RETRY_BACKOFF: [Duration; 4] = [
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(5),
    Duration::from_secs(30),
];

/// How long `log` may block once the queue is full.
const ENQUEUE_BLOCK_BUDGET: Duration = Duration::from_secs(5);
/// Deadline for one transactional flush attempt.
const FLUSH_ATTEMPT_BUDGET: Duration = Duration::from_secs(30);
/// Cadence of dead-letter recovery.
const DLQ_RECOVERY_INTERVAL: Duration = Duration::from_secs(300);
/// Capacity of the committed-ids channel feeding the push aggregation path.
const PENDING_AGGREGATION_CAPACITY: usize = 500;

/// Counter snapshot for operational surfaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SpendLoggerStats {
    pub queued: u64,
    pub dropped: u64,
    pub flushed: u64,
    pub errors: u64,
    pub queue_full_count: u64,
    pub queue_depth: usize,
    pub dlq_size: usize,
    pub dlq_overflow: u64,
    pub aggregation_count: u64,
    pub last_aggregation_time: Option<DateTime<Utc>>,
    pub last_dlq_recovery_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    queued: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
    errors: AtomicU64,
    queue_full: AtomicU64,
}

/// State shared between the producer handle and the three workers.
struct LoggerCore {
    pool: Arc<DbPool>,
    batch_size: usize,
    flush_interval: Duration,
    counters: Counters,
    dlq: DeadLetterQueue,
    agg_tx: mpsc::Sender<Vec<Uuid>>,
    agg_stats: Arc<AggregationStats>,
    stop_tx: watch::Sender<bool>,
    last_dlq_recovery: RwLock<Option<DateTime<Utc>>>,
}

impl LoggerCore {
    /// Hand committed ids to the push aggregation path without blocking.
    /// A full channel is fine: the safety-net sweep covers whatever the
    /// push path misses.
    fn publish_for_aggregation(&self, ids: Vec<Uuid>) {
        if ids.is_empty() {
            return;
        }
        match self.agg_tx.try_send(ids) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("pending aggregation channel full; safety net will cover this batch");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Bounded-queue spend logger with one batch worker, one DLQ recovery
/// worker, and one aggregation worker.
pub struct SpendLogger {
    tx: mpsc::Sender<SpendLogEntry>,
    queue_size: usize,
    core: Arc<LoggerCore>,
    safety_net_interval: Duration,
    started: AtomicBool,
    stopped: AtomicBool,
    rx_slot: Mutex<Option<mpsc::Receiver<SpendLogEntry>>>,
    agg_rx_slot: Mutex<Option<mpsc::Receiver<Vec<Uuid>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SpendLogger {
    pub fn new(pool: Arc<DbPool>, cfg: &DataPlaneConfig) -> Self {
        let queue_size = cfg.log_queue_size.max(1);
        let (tx, rx) = mpsc::channel(queue_size);
        let (agg_tx, agg_rx) = mpsc::channel(PENDING_AGGREGATION_CAPACITY);
        let (stop_tx, _stop_rx) = watch::channel(false);

        let core = Arc::new(LoggerCore {
            pool,
            batch_size: cfg.log_batch_size.max(1),
            flush_interval: cfg.log_flush_interval(),
            counters: Counters::default(),
            dlq: DeadLetterQueue::new(),
            agg_tx,
            agg_stats: Arc::new(AggregationStats::default()),
            stop_tx,
            last_dlq_recovery: RwLock::new(None),
        });

        Self {
            tx,
            queue_size,
            core,
            safety_net_interval: DEFAULT_SAFETY_NET_INTERVAL,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            rx_slot: Mutex::new(Some(rx)),
            agg_rx_slot: Mutex::new(Some(agg_rx)),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Override the safety-net cadence before `start`. Tests and small
    /// deployments run it tighter than the 5-minute default.
    pub fn set_safety_net_interval(&mut self, interval: Duration) {
        self.safety_net_interval = interval;
    }

    /// Spawn the three workers. Single-shot: later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let rx = self.rx_slot.lock().take();
        let agg_rx = self.agg_rx_slot.lock().take();
        let (Some(rx), Some(agg_rx)) = (rx, agg_rx) else {
            return;
        };

        let mut workers = self.workers.lock();
        workers.push(tokio::spawn(batch_worker(
            Arc::clone(&self.core),
            rx,
            self.core.stop_tx.subscribe(),
        )));
        workers.push(tokio::spawn(dlq_worker(
            Arc::clone(&self.core),
            self.core.stop_tx.subscribe(),
        )));

        let scheduler = AggregationScheduler::new(
            Arc::clone(&self.core.pool),
            Arc::clone(&self.core.agg_stats),
            self.safety_net_interval,
        );
        workers.push(tokio::spawn(scheduler.run(
            agg_rx,
            self.core.stop_tx.subscribe(),
        )));

        info!(
            batch_size = self.core.batch_size,
            flush_interval = ?self.core.flush_interval,
            queue_size = self.queue_size,
            "spend logger started"
        );
    }

    /// Enqueue one entry.
    ///
    /// Fast path is a non-blocking send. When the queue is full the call
    /// blocks up to five seconds on the same channel; timing out returns
    /// [`GateError::QueueFull`]. Exactly one of `queued`/`dropped`
    /// increments per call.
    pub async fn log(&self, entry: SpendLogEntry) -> Result<(), GateError> {
        let entry = match self.tx.try_send(entry) {
            Ok(()) => {
                self.core.counters.queued.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.core.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(GateError::QueueFull);
            }
            Err(mpsc::error::TrySendError::Full(entry)) => entry,
        };

        match tokio::time::timeout(ENQUEUE_BLOCK_BUDGET, self.tx.send(entry)).await {
            Ok(Ok(())) => {
                self.core.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Ok(Err(_closed)) => {
                self.core.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(GateError::QueueFull)
            }
            Err(_elapsed) => {
                self.core.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.core.counters.queue_full.fetch_add(1, Ordering::Relaxed);
                warn!(
                    wait = ?ENQUEUE_BLOCK_BUDGET,
                    "spend log queue full; dropping entry"
                );
                Err(GateError::QueueFull)
            }
        }
    }

    pub fn stats(&self) -> SpendLoggerStats {
        let c = &self.core.counters;
        SpendLoggerStats {
            queued: c.queued.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            queue_full_count: c.queue_full.load(Ordering::Relaxed),
            queue_depth: self.queue_size.saturating_sub(self.tx.capacity()),
            dlq_size: self.core.dlq.len(),
            dlq_overflow: self.core.dlq.overflow_count(),
            aggregation_count: self.core.agg_stats.count(),
            last_aggregation_time: self.core.agg_stats.last_run(),
            last_dlq_recovery_time: *self.core.last_dlq_recovery.read(),
        }
    }

    /// Inspect the dead-letter queue.
    pub fn dlq_snapshot(&self) -> Vec<DeadLetterBatch> {
        self.core.dlq.snapshot()
    }

    /// Stop the workers, draining whatever is queued first. Idempotent;
    /// `deadline` bounds the whole drain-and-join.
    pub async fn shutdown(&self, deadline: Duration) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let started_at = tokio::time::Instant::now();
        let _ = self.core.stop_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(deadline, join_all).await.is_err() {
            warn!(?deadline, "spend logger workers did not stop in time");
        }

        info!(
            elapsed = ?started_at.elapsed(),
            dlq_size = self.core.dlq.len(),
            "spend logger stopped"
        );
    }
}

// ---------------------------------------------------------------------------
// Batch worker
// ---------------------------------------------------------------------------

async fn batch_worker(
    core: Arc<LoggerCore>,
    mut rx: mpsc::Receiver<SpendLogEntry>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut batch: Vec<SpendLogEntry> = Vec::with_capacity(core.batch_size);
    let mut ticker = tokio::time::interval(core.flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(entry) => {
                    batch.push(entry);
                    if batch.len() >= core.batch_size {
                        flush_with_backoff(
                            &core,
                            std::mem::take(&mut batch),
                            &mut stop_rx,
                            &RETRY_BACKOFF,
                        )
                        .await;
                        ticker.reset();
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush_with_backoff(
                        &core,
                        std::mem::take(&mut batch),
                        &mut stop_rx,
                        &RETRY_BACKOFF,
                    )
                    .await;
                }
            }
            _ = stop_rx.changed() => {
                // Shutdown: stop accepting, drain what is already queued,
                // flush, and exit.
                rx.close();
                while let Ok(entry) = rx.try_recv() {
                    batch.push(entry);
                    if batch.len() >= core.batch_size {
                        flush_with_backoff(
                            &core,
                            std::mem::take(&mut batch),
                            &mut stop_rx,
                            &RETRY_BACKOFF,
                        )
                        .await;
                    }
                }
                if !batch.is_empty() {
                    flush_with_backoff(
                        &core,
                        std::mem::take(&mut batch),
                        &mut stop_rx,
                        &RETRY_BACKOFF,
                    )
                    .await;
                }
                break;
            }
        }
    }
    debug!("spend log batch worker exited");
}

/// Run the retry ladder over one batch. Sleeps are interruptible: once
/// shutdown is signaled, the batch goes straight to the dead-letter queue
/// instead of waiting out the backoff.
async fn flush_with_backoff(
    core: &LoggerCore,
    batch: Vec<SpendLogEntry>,
    stop_rx: &mut watch::Receiver<bool>,
    schedule: &[Duration],
) {
    if batch.is_empty() {
        return;
    }
    let mut last_error = String::new();
    let mut attempts: u32 = 0;

    for delay in schedule {
        if !delay.is_zero() {
            let interrupted = if *stop_rx.borrow() {
                true
            } else {
                tokio::select! {
                    _ = tokio::time::sleep(*delay) => false,
                    _ = stop_rx.changed() => true,
                }
            };
            if interrupted {
                warn!(
                    entries = batch.len(),
                    attempts, "shutdown during flush backoff; batch routed to dead letter queue"
                );
                core.dlq.push(DeadLetterBatch {
                    entries: batch,
                    failed_at: Utc::now(),
                    last_error,
                    attempts,
                });
                return;
            }
        }

        attempts += 1;
        match try_flush(core, &batch).await {
            Ok(inserted) => {
                core.counters
                    .flushed
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                debug!(
                    entries = batch.len(),
                    inserted = inserted.len(),
                    attempts,
                    "spend log batch committed"
                );
                core.publish_for_aggregation(inserted);
                return;
            }
            Err(err) => {
                last_error = err.to_string();
                warn!(
                    attempt = attempts,
                    entries = batch.len(),
                    error = %err,
                    "spend log flush attempt failed"
                );
            }
        }
    }

    core.counters
        .errors
        .fetch_add(batch.len() as u64, Ordering::Relaxed);
    warn!(
        entries = batch.len(),
        attempts, "spend log batch exhausted retries; routing to dead letter queue"
    );
    core.dlq.push(DeadLetterBatch {
        entries: batch,
        failed_at: Utc::now(),
        last_error,
        attempts,
    });
}

/// One transactional flush attempt with a 30 s deadline.
async fn try_flush(core: &LoggerCore, batch: &[SpendLogEntry]) -> Result<Vec<Uuid>, GateError> {
    match tokio::time::timeout(FLUSH_ATTEMPT_BUDGET, flush_once(core, batch)).await {
        Ok(result) => result,
        Err(_elapsed) => Err(GateError::ConnectionFailed(
            "spend log flush attempt timed out".to_string(),
        )),
    }
}

/// Insert the batch and apply the per-level spend deltas in one
/// transaction. Returns the request ids actually inserted; duplicates from
/// earlier partial successes are excluded by `ON CONFLICT … RETURNING` and
/// contribute nothing to the deltas.
async fn flush_once(core: &LoggerCore, batch: &[SpendLogEntry]) -> Result<Vec<Uuid>, GateError> {
    if batch.is_empty() {
        return Ok(Vec::new());
    }
    if !core.pool.is_healthy() {
        return Err(GateError::ConnectionFailed(
            "connection pool is unhealthy".to_string(),
        ));
    }

    let mut conn = core.pool.acquire().await?;
    let mut tx = conn.begin().await.map_err(GateError::connection)?;

    let sql = queries::build_spend_log_insert(batch.len());
    let mut insert = sqlx::query_scalar::<_, Uuid>(&sql);
    for entry in batch {
        insert = insert
            .bind(entry.request_id)
            .bind(entry.started_at)
            .bind(entry.completed_at)
            .bind(entry.call_type.as_str())
            .bind(entry.endpoint.as_str())
            .bind(entry.model.as_str())
            .bind(entry.model_id.as_str())
            .bind(entry.model_group.as_str())
            .bind(entry.provider.as_str())
            .bind(entry.session_id.as_str())
            .bind(entry.prompt_tokens)
            .bind(entry.completion_tokens)
            .bind(entry.total_tokens)
            .bind(entry.metadata.as_str())
            .bind(entry.spend)
            .bind(entry.api_key_hash.as_str())
            .bind(entry.user_id.as_str())
            .bind(entry.team_id.as_str())
            .bind(entry.organization_id.as_str())
            .bind(entry.end_user_id.as_str())
            .bind(entry.agent_id.as_str())
            .bind(entry.request_tags.as_str())
            .bind(entry.status.as_str())
            .bind(entry.requester_ip.as_str())
            .bind(entry.mcp_tool.as_deref());
    }
    let inserted: Vec<Uuid> = insert
        .fetch_all(&mut *tx)
        .await
        .map_err(GateError::connection)?;

    let inserted_set: HashSet<Uuid> = inserted.iter().copied().collect();
    let updates = aggregate_spend_updates(
        batch
            .iter()
            .filter(|entry| inserted_set.contains(&entry.request_id)),
    );
    apply_spend_updates(&mut tx, &updates).await?;

    tx.commit().await.map_err(GateError::connection)?;
    Ok(inserted)
}

/// Apply the six per-level delta maps inside the flush transaction.
async fn apply_spend_updates(
    tx: &mut Transaction<'_, Postgres>,
    updates: &SpendUpdates,
) -> Result<(), GateError> {
    for (token, amount) in &updates.tokens {
        sqlx::query(queries::ADD_TOKEN_SPEND)
            .bind(*amount)
            .bind(token.as_str())
            .execute(&mut **tx)
            .await
            .map_err(GateError::connection)?;
    }
    for (user, amount) in &updates.users {
        sqlx::query(queries::ADD_USER_SPEND)
            .bind(*amount)
            .bind(user.as_str())
            .execute(&mut **tx)
            .await
            .map_err(GateError::connection)?;
    }
    for (team, amount) in &updates.teams {
        sqlx::query(queries::ADD_TEAM_SPEND)
            .bind(*amount)
            .bind(team.as_str())
            .execute(&mut **tx)
            .await
            .map_err(GateError::connection)?;
    }
    for (org, amount) in &updates.orgs {
        sqlx::query(queries::ADD_ORG_SPEND)
            .bind(*amount)
            .bind(org.as_str())
            .execute(&mut **tx)
            .await
            .map_err(GateError::connection)?;
    }
    for (key, amount) in &updates.team_members {
        let Some((team, user)) = split_composite_key(key) else {
            warn!(key = %key, "skipping malformed team membership key");
            continue;
        };
        sqlx::query(queries::ADD_TEAM_MEMBER_SPEND)
            .bind(*amount)
            .bind(team)
            .bind(user)
            .execute(&mut **tx)
            .await
            .map_err(GateError::connection)?;
    }
    for (key, amount) in &updates.org_members {
        let Some((org, user)) = split_composite_key(key) else {
            warn!(key = %key, "skipping malformed organization membership key");
            continue;
        };
        sqlx::query(queries::ADD_ORG_MEMBER_SPEND)
            .bind(*amount)
            .bind(org)
            .bind(user)
            .execute(&mut **tx)
            .await
            .map_err(GateError::connection)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Dead-letter recovery worker
// ---------------------------------------------------------------------------

async fn dlq_worker(core: Arc<LoggerCore>, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(DLQ_RECOVERY_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                // Final recovery attempt before exit.
                recover_dead_letters(&core).await;
                break;
            }
            _ = ticker.tick() => {
                recover_dead_letters(&core).await;
            }
        }
    }
    debug!("dead letter recovery worker exited");
}

/// Drain the queue, retry each batch once through the transactional flush,
/// and re-append failures in their original order.
async fn recover_dead_letters(core: &LoggerCore) {
    let batches = core.dlq.drain();
    if !batches.is_empty() {
        info!(batches = batches.len(), "retrying dead letter batches");
    }

    for mut batch in batches {
        match try_flush(core, &batch.entries).await {
            Ok(inserted) => {
                core.counters
                    .flushed
                    .fetch_add(batch.entries.len() as u64, Ordering::Relaxed);
                info!(
                    entries = batch.entries.len(),
                    attempts = batch.attempts,
                    "dead letter batch recovered"
                );
                core.publish_for_aggregation(inserted);
            }
            Err(err) => {
                batch.attempts += 1;
                batch.last_error = err.to_string();
                core.dlq.push(batch);
            }
        }
    }

    *core.last_dlq_recovery.write() = Some(Utc::now());
}
