// crates/sg-spend/src/lib.rs
//! Write path of the spendgate data plane.
//!
//! The spend logger turns per-request records into batched, transactional
//! catalog writes that survive short database outages: a bounded queue with
//! a 5 s backpressure window, one batch worker with an interruptible retry
//! ladder, an in-memory dead-letter queue with periodic recovery, and the
//! two-path daily aggregation scheduler (per-commit push plus an
//! advisory-locked safety-net sweep).

pub mod aggregate;
pub mod dlq;
pub mod logger;
pub mod updates;

pub use dlq::{DeadLetterBatch, DeadLetterQueue};
pub use logger::{SpendLogger, SpendLoggerStats};
pub use updates::{aggregate_spend_updates, split_composite_key, SpendUpdates};
