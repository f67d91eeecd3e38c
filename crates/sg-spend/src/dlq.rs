//! In-memory dead-letter queue for batches that exhausted their retries.
//!
//! Bounded FIFO of 10 batches; inserting into a full queue drops the oldest
//! batch. Not persisted: a restart loses whatever is queued, an accepted
//! trade against the complexity of a durable side store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::error;

use sg_types::SpendLogEntry;

/// Maximum batches retained.
pub const DLQ_CAPACITY: usize = 10;
/// Size at which an alert is logged on every insert.
pub const DLQ_ALERT_THRESHOLD: usize = 5;

/// One failed batch with its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct DeadLetterBatch {
    pub entries: Vec<SpendLogEntry>,
    pub failed_at: DateTime<Utc>,
    pub last_error: String,
    pub attempts: u32,
}

/// Bounded FIFO of failed batches. One mutex; callers hold it only for
/// queue surgery, never across I/O.
#[derive(Debug, Default)]
pub struct DeadLetterQueue {
    batches: Mutex<VecDeque<DeadLetterBatch>>,
    overflow: AtomicU64,
}

impl DeadLetterQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch, dropping the oldest when full.
    pub fn push(&self, batch: DeadLetterBatch) {
        let len = {
            let mut batches = self.batches.lock();
            if batches.len() >= DLQ_CAPACITY {
                if let Some(dropped) = batches.pop_front() {
                    self.overflow.fetch_add(1, Ordering::Relaxed);
                    error!(
                        failed_at = %dropped.failed_at,
                        entries = dropped.entries.len(),
                        attempts = dropped.attempts,
                        "dead letter queue overflow: dropping oldest batch"
                    );
                }
            }
            batches.push_back(batch);
            batches.len()
        };

        if len >= DLQ_ALERT_THRESHOLD {
            error!(size = len, "dead letter queue is filling up");
        }
    }

    /// Atomically take every queued batch, leaving the queue empty.
    ///
    /// Recovery drains first and re-appends failures afterwards, so batches
    /// added concurrently are never retried twice in one cycle.
    pub fn drain(&self) -> Vec<DeadLetterBatch> {
        self.batches.lock().drain(..).collect()
    }

    /// Clone the queue contents for inspection.
    pub fn snapshot(&self) -> Vec<DeadLetterBatch> {
        self.batches.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.lock().is_empty()
    }

    /// How many batches have been dropped to make room.
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }
}
