mod common;

use common::{clock, create_task, update_task, Replica};
use oplog_model::{OpType, OperationDraft};
use oplog_store::OpLogStore;
use oplog_sync::StaleOperationResolver;
use oplog_types::EntityType;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

#[tokio::test]
async fn one_replacement_per_entity_carries_current_state() {
    let replica = Replica::new("a");
    let resolver = StaleOperationResolver::new(replica.ctx().clone());
    let create = replica.engine.record_local_operation(create_task("t1", "one")).await.unwrap();
    let update = replica.engine.record_local_operation(update_task("t1", "two")).await.unwrap();

    let created = resolver
        .resolve_stale_local_ops(&[create.clone(), update.clone()], &[clock(&[("b", 4)])], None)
        .await
        .unwrap();
    assert_eq!(created, 1);

    assert!(replica.store.get_op_by_id(&create.id).await.unwrap().unwrap().is_rejected());
    assert!(replica.store.get_op_by_id(&update.id).await.unwrap().unwrap().is_rejected());

    let unsynced = replica.store.get_unsynced().await.unwrap();
    assert_eq!(unsynced.len(), 1);
    let replacement = &unsynced[0].op;
    assert_eq!(replacement.op_type, OpType::Update);
    assert_eq!(replacement.payload["changes"]["title"], json!("two"));
    assert_eq!(replacement.payload["replace"], json!(true));
    assert!(replacement.vector_clock.is_after(&update.vector_clock));
    assert!(replacement.vector_clock.is_after(&clock(&[("b", 4)])));
    assert_eq!(replica.title("t1").await.as_deref(), Some("two"));
}

#[tokio::test]
async fn deleted_entity_gets_a_delete_replacement() {
    let replica = Replica::new("a");
    let resolver = StaleOperationResolver::new(replica.ctx().clone());
    let create = replica.engine.record_local_operation(create_task("t1", "one")).await.unwrap();
    let delete = replica
        .engine
        .record_local_operation(OperationDraft::new(OpType::Delete, EntityType::Task, "t1", Value::Null))
        .await
        .unwrap();

    let created = resolver
        .resolve_stale_local_ops(&[create, delete], &[], Some(&clock(&[("b", 2)])))
        .await
        .unwrap();
    assert_eq!(created, 1);

    let unsynced = replica.store.get_unsynced().await.unwrap();
    assert_eq!(unsynced[0].op.op_type, OpType::Delete);
    assert!(unsynced[0].op.vector_clock.is_after(&clock(&[("b", 2)])));
}

#[tokio::test]
async fn vanished_entity_without_delete_is_dropped() {
    let replica = Replica::new("a");
    let resolver = StaleOperationResolver::new(replica.ctx().clone());
    let create = replica.engine.record_local_operation(create_task("t1", "one")).await.unwrap();
    replica
        .engine
        .record_local_operation(OperationDraft::new(OpType::Delete, EntityType::Task, "t1", Value::Null))
        .await
        .unwrap();

    let created = resolver.resolve_stale_local_ops(&[create.clone()], &[], None).await.unwrap();
    assert_eq!(created, 0);
    assert!(replica.store.get_op_by_id(&create.id).await.unwrap().unwrap().is_rejected());
}

#[tokio::test]
async fn nothing_stale_is_a_no_op() {
    let replica = Replica::new("a");
    let resolver = StaleOperationResolver::new(replica.ctx().clone());
    assert_eq!(resolver.resolve_stale_local_ops(&[], &[], None).await.unwrap(), 0);
}
