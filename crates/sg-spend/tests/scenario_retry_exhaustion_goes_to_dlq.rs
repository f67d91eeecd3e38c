use std::time::Duration;

use sg_config::DataPlaneConfig;
use sg_db::DbPool;
use sg_spend::SpendLogger;
use sg_types::SpendLogEntry;

fn config() -> DataPlaneConfig {
    let mut cfg = DataPlaneConfig::with_database_url("postgres://sg:sg@127.0.0.1:1/sg");
    cfg.log_queue_size = 16;
    cfg.log_batch_size = 3;
    cfg.log_flush_interval_secs = 1;
    cfg
}

/// A batch of three against a dead database fails all four attempts of the
/// retry ladder and lands in the dead-letter queue with its bookkeeping
/// intact.
#[tokio::test(start_paused = true)]
async fn scenario_retry_exhaustion_goes_to_dlq() {
    let logger = SpendLogger::new(DbPool::disconnected(), &config());
    logger.start();
    logger.start(); // single-shot: the second call is a no-op

    for _ in 0..3 {
        logger
            .log(SpendLogEntry::default())
            .await
            .expect("queue accepts the batch");
    }

    // The full ladder is 0s + 1s + 5s + 30s of (paused) backoff.
    let mut waited = 0u32;
    while logger.stats().dlq_size == 0 {
        waited += 1;
        assert!(waited < 120, "batch never reached the dead letter queue");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    let stats = logger.stats();
    assert_eq!(stats.dlq_size, 1);
    assert_eq!(stats.errors, 3, "every entry of the batch counts as an error");
    assert_eq!(stats.flushed, 0);
    assert_eq!(stats.dlq_overflow, 0);

    let batches = logger.dlq_snapshot();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].entries.len(), 3);
    assert_eq!(batches[0].attempts, 4);
    assert!(!batches[0].last_error.is_empty());

    logger.shutdown(Duration::from_secs(5)).await;
    // The batch survives shutdown in the dead letter queue (the final
    // recovery attempt fails against the same dead database).
    assert_eq!(logger.stats().dlq_size, 1);
}
