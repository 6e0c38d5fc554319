use oplog_sync::{LockName, LockService};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn guard_releases_on_drop() {
    let locks = LockService::new();
    let guard = locks.acquire(LockName::OperationLog).await;
    assert!(locks.is_locked(LockName::OperationLog));
    assert!(!locks.is_locked(LockName::Upload));
    drop(guard);
    assert!(!locks.is_locked(LockName::OperationLog));
}

#[tokio::test]
async fn second_holder_waits() {
    let locks = Arc::new(LockService::default());
    let guard = locks.acquire(LockName::Upload).await;

    let waiter = {
        let locks = Arc::clone(&locks);
        tokio::spawn(async move {
            let _guard = locks.acquire(LockName::Upload).await;
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    drop(guard);
    tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
}
