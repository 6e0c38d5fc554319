mod common;

use async_trait::async_trait;
use common::{clock, create_task, Replica};
use oplog_clock::VectorClock;
use oplog_model::{OpType, Operation};
use oplog_store::OpLogStore;
use oplog_sync::provider::{ErrorCode, RejectedOp};
use oplog_sync::rejected::{DownloadCallback, DownloadOutcome};
use oplog_sync::{RejectedOpsHandler, SyncConfig, SyncNotice, SyncResult};
use pretty_assertions::assert_eq;
use std::sync::Mutex;

/// Download callback returning canned outcomes and recording calls.
#[derive(Default)]
struct ScriptedDownload {
    normal: DownloadOutcome,
    forced: DownloadOutcome,
    calls: Mutex<Vec<bool>>,
}

impl ScriptedDownload {
    fn calls(&self) -> Vec<bool> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DownloadCallback for ScriptedDownload {
    async fn download(&self, force_from_seq0: bool) -> SyncResult<DownloadOutcome> {
        self.calls.lock().unwrap().push(force_from_seq0);
        Ok(if force_from_seq0 { self.forced.clone() } else { self.normal.clone() })
    }
}

fn rejection(op: &Operation, code: ErrorCode) -> RejectedOp {
    RejectedOp {
        op_id: op.id,
        error: Some(format!("{code:?}")),
        error_code: Some(code),
    }
}

async fn recorded(replica: &Replica, id: &str) -> Operation {
    replica.engine.record_local_operation(create_task(id, id)).await.unwrap()
}

#[tokio::test]
async fn quota_rejections_notify_once_and_keep_ops() {
    let replica = Replica::new("a");
    let handler = RejectedOpsHandler::new(replica.ctx().clone());
    let first = recorded(&replica, "t1").await;
    let second = recorded(&replica, "t2").await;

    let outcome = handler
        .handle_rejected_ops(
            &[
                rejection(&first, ErrorCode::StorageQuotaExceeded),
                rejection(&second, ErrorCode::StorageQuotaExceeded),
            ],
            &ScriptedDownload::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.kept_for_retry, 2);
    let quota = replica
        .notifier
        .notices()
        .into_iter()
        .filter(|n| *n == SyncNotice::StorageQuotaExceeded)
        .count();
    assert_eq!(quota, 1);
    assert_eq!(replica.store.get_unsynced().await.unwrap().len(), 2);
}

#[tokio::test]
async fn internal_errors_are_retried_later() {
    let replica = Replica::new("a");
    let handler = RejectedOpsHandler::new(replica.ctx().clone());
    let op = recorded(&replica, "t1").await;

    let outcome = handler
        .handle_rejected_ops(&[rejection(&op, ErrorCode::InternalError)], &ScriptedDownload::default())
        .await
        .unwrap();
    assert_eq!(outcome.kept_for_retry, 1);
    assert!(!replica.store.get_op_by_id(&op.id).await.unwrap().unwrap().is_rejected());
}

#[tokio::test]
async fn validation_errors_are_permanent_and_notified_past_threshold() {
    let replica = Replica::with_config(
        "a",
        SyncConfig {
            max_rejected_ops_before_warning: 2,
            ..Default::default()
        },
    );
    let handler = RejectedOpsHandler::new(replica.ctx().clone());
    let first = recorded(&replica, "t1").await;
    let second = recorded(&replica, "t2").await;

    let outcome = handler
        .handle_rejected_ops(
            &[
                rejection(&first, ErrorCode::ValidationError),
                rejection(&second, ErrorCode::Unknown),
            ],
            &ScriptedDownload::default(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.permanently_rejected, 2);
    assert!(replica.store.get_unsynced().await.unwrap().is_empty());
    assert!(replica.notifier.notices().contains(&SyncNotice::OpsRejected { count: 2 }));
}

#[tokio::test]
async fn already_synced_ops_are_ignored() {
    let replica = Replica::new("a");
    let handler = RejectedOpsHandler::new(replica.ctx().clone());
    let op = recorded(&replica, "t1").await;
    let seq = replica.store.get_op_by_id(&op.id).await.unwrap().unwrap().seq;
    replica.store.mark_synced(&[seq]).await.unwrap();

    let outcome = handler
        .handle_rejected_ops(&[rejection(&op, ErrorCode::ValidationError)], &ScriptedDownload::default())
        .await
        .unwrap();
    assert_eq!(outcome.permanently_rejected, 0);
    assert!(!replica.store.get_op_by_id(&op.id).await.unwrap().unwrap().is_rejected());
}

#[tokio::test]
async fn concurrent_rejection_is_republished_after_download() {
    let replica = Replica::new("a");
    let handler = RejectedOpsHandler::new(replica.ctx().clone());
    let op = recorded(&replica, "t1").await;
    let server = clock(&[("b", 7)]);
    let download = ScriptedDownload {
        normal: DownloadOutcome {
            new_ops: 1,
            snapshot_vector_clock: Some(server.clone()),
            ..Default::default()
        },
        ..Default::default()
    };

    let outcome = handler
        .handle_rejected_ops(&[rejection(&op, ErrorCode::ConcurrentModification)], &download)
        .await
        .unwrap();

    assert_eq!(download.calls(), vec![false]);
    assert_eq!(outcome.merged_ops_created, 1);
    assert!(replica.store.get_op_by_id(&op.id).await.unwrap().unwrap().is_rejected());

    let unsynced = replica.store.get_unsynced().await.unwrap();
    assert_eq!(unsynced.len(), 1);
    let replacement = &unsynced[0].op;
    assert_eq!(replacement.op_type, OpType::Update);
    assert!(replacement.vector_clock.is_after(&server));
    assert!(replacement.vector_clock.is_after(&op.vector_clock));
    assert_eq!(replacement.payload["changes"]["title"], serde_json::json!("t1"));
}

#[tokio::test]
async fn forced_download_without_clocks_rejects() {
    let replica = Replica::new("a");
    let handler = RejectedOpsHandler::new(replica.ctx().clone());
    let op = recorded(&replica, "t1").await;
    let download = ScriptedDownload::default();

    let outcome = handler
        .handle_rejected_ops(&[rejection(&op, ErrorCode::ConcurrentModification)], &download)
        .await
        .unwrap();

    assert_eq!(download.calls(), vec![false, true]);
    assert_eq!(outcome.merged_ops_created, 0);
    assert!(replica.store.get_op_by_id(&op.id).await.unwrap().unwrap().is_rejected());
    assert!(replica
        .notifier
        .notices()
        .iter()
        .any(|n| matches!(n, SyncNotice::ConflictResolutionFailed { .. })));
}

#[tokio::test]
async fn forced_download_clocks_feed_the_replacement() {
    let replica = Replica::new("a");
    let handler = RejectedOpsHandler::new(replica.ctx().clone());
    let op = recorded(&replica, "t1").await;
    let download = ScriptedDownload {
        forced: DownloadOutcome {
            all_op_clocks: vec![clock(&[("b", 3)]), clock(&[("c", 9)])],
            ..Default::default()
        },
        ..Default::default()
    };

    let outcome = handler
        .handle_rejected_ops(&[rejection(&op, ErrorCode::ConcurrentModification)], &download)
        .await
        .unwrap();
    assert_eq!(outcome.merged_ops_created, 1);

    let unsynced = replica.store.get_unsynced().await.unwrap();
    let merged = VectorClock::merge_all([&clock(&[("b", 3)]), &clock(&[("c", 9)])]);
    assert!(unsynced[0].op.vector_clock.is_after(&merged));
}
