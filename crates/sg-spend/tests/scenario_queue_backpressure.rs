use sg_config::DataPlaneConfig;
use sg_db::DbPool;
use sg_spend::SpendLogger;
use sg_types::{GateError, SpendLogEntry};

fn config(queue_size: usize) -> DataPlaneConfig {
    let mut cfg = DataPlaneConfig::with_database_url("postgres://sg:sg@127.0.0.1:1/sg");
    cfg.log_queue_size = queue_size;
    cfg.log_batch_size = 100;
    cfg
}

/// With no consumer running, a queue of two accepts two entries; the third
/// blocks out its five-second window and returns `QueueFull`. Exactly one
/// of queued/dropped increments per call.
#[tokio::test(start_paused = true)]
async fn scenario_queue_backpressure() {
    let logger = SpendLogger::new(DbPool::disconnected(), &config(2));
    // start() is intentionally not called: nothing drains the queue.

    logger
        .log(SpendLogEntry::default())
        .await
        .expect("first entry fits");
    logger
        .log(SpendLogEntry::default())
        .await
        .expect("second entry fits");

    let err = logger
        .log(SpendLogEntry::default())
        .await
        .expect_err("third entry must time out");
    assert_eq!(err, GateError::QueueFull);

    let stats = logger.stats();
    assert_eq!(stats.queued, 2);
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.queue_full_count, 1);
    assert_eq!(stats.queue_depth, 2);
}
