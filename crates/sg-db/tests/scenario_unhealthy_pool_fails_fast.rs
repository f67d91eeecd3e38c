use std::time::Duration;

use sg_db::DbPool;
use sg_types::GateError;

#[tokio::test]
async fn scenario_unhealthy_pool_fails_fast() {
    let pool = DbPool::disconnected();
    assert!(!pool.is_healthy());

    // Acquire refuses immediately while the health flag is down.
    let err = pool.acquire().await.expect_err("unhealthy pool must refuse");
    assert!(matches!(err, GateError::ConnectionFailed(_)));

    // Forcing the flag healthy exposes the real connect failure instead of
    // the fast refusal; the address is non-routable.
    pool.force_health(true);
    let err = tokio::time::timeout(Duration::from_secs(5), pool.acquire())
        .await
        .expect("acquire must respect its own timeout")
        .expect_err("connect to a closed port must fail");
    assert!(matches!(err, GateError::ConnectionFailed(_)));
}

#[tokio::test]
async fn scenario_close_is_idempotent() {
    let pool = DbPool::disconnected();
    pool.close().await;
    pool.close().await;

    let stats = pool.stats();
    assert!(stats.closed);
    assert!(!stats.healthy);

    let err = pool.acquire().await.expect_err("closed pool must refuse");
    assert!(matches!(err, GateError::ConnectionFailed(_)));
}
