mod common;

use common::{clock, create_task, task_op, Replica};
use oplog_model::{OpSource, OpType, Operation};
use oplog_store::OpLogStore;
use oplog_types::ClientId;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

fn import_from(client: &str, state: Value, vc: &[(&str, u64)]) -> Operation {
    Operation::full_state(ClientId::from(client), OpType::SyncImport, state, clock(vc))
}

async fn append_synced(replica: &Replica, op: &Operation) {
    let seq = replica.store.append(op, OpSource::Local, false).await.unwrap();
    replica.store.mark_synced(&[seq]).await.unwrap();
}

fn tasks(entries: &[(&str, &str)]) -> Value {
    let by_id: serde_json::Map<String, Value> = entries
        .iter()
        .map(|(id, title)| ((*id).to_owned(), json!({ "title": title })))
        .collect();
    json!({ "TASK": by_id })
}

#[tokio::test]
async fn ops_unaware_of_the_import_are_discarded() {
    let replica = Replica::new("a");
    let import = import_from("X", tasks(&[]), &[("X", 1)]);
    let unaware = task_op("Y", OpType::Update, "t1", json!({}), &[("Y", 10)]);
    let aware = task_op("Y", OpType::Update, "t1", json!({}), &[("X", 1), ("Y", 11)]);

    let filtered = replica
        .engine
        .pipeline()
        .imports()
        .filter_invalidated(vec![unaware.clone(), import.clone(), aware.clone()])
        .await
        .unwrap();

    assert!(filtered.import_in_batch);
    assert_eq!(filtered.latest_import.map(|op| op.id), Some(import.id));
    assert_eq!(filtered.invalidated, vec![unaware]);
    assert_eq!(filtered.valid.iter().map(|op| op.id).collect::<Vec<_>>(), vec![import.id, aware.id]);
}

#[tokio::test]
async fn older_import_in_the_same_batch_is_invalidated() {
    let replica = Replica::new("a");
    let first = import_from("X", tasks(&[("t1", "first")]), &[("X", 1)]);
    let second = import_from("Y", tasks(&[("t2", "second")]), &[("Y", 1)]);

    let outcome = replica.engine.pipeline().process_remote_ops(vec![first, second]).await.unwrap();
    assert_eq!(outcome.invalidated, 1);
    assert_eq!(replica.title("t1").await, None);
    assert_eq!(replica.title("t2").await.as_deref(), Some("second"));
}

#[tokio::test]
async fn stored_import_filters_later_batches() {
    let replica = Replica::new("a");
    let import = import_from("X", tasks(&[("t1", "imported")]), &[("X", 1)]);
    replica.engine.pipeline().process_remote_ops(vec![import]).await.unwrap();

    let unaware = task_op("Y", OpType::Update, "t1", json!({"title": "lost"}), &[("Y", 4)]);
    let outcome = replica.engine.pipeline().process_remote_ops(vec![unaware]).await.unwrap();
    assert_eq!(outcome.invalidated, 1);
    assert_eq!(replica.title("t1").await.as_deref(), Some("imported"));
}

#[tokio::test]
async fn import_replaces_state_and_rejects_pending_local_ops() {
    let replica = Replica::new("a");
    let local = replica.engine.record_local_operation(create_task("t1", "mine")).await.unwrap();
    let import = import_from("b", tasks(&[("t9", "imported")]), &[("b", 1)]);

    let outcome = replica.engine.pipeline().process_remote_ops(vec![import]).await.unwrap();

    assert_eq!(outcome.conflicts, 0);
    assert_eq!(outcome.applied, 1);
    assert_eq!(replica.title("t1").await, None);
    assert_eq!(replica.title("t9").await.as_deref(), Some("imported"));
    assert!(replica.store.get_op_by_id(&local.id).await.unwrap().unwrap().is_rejected());
    assert!(replica.store.get_unsynced().await.unwrap().is_empty());
}

#[tokio::test]
async fn ops_following_the_import_apply_after_it() {
    let replica = Replica::new("a");
    let import = import_from("b", tasks(&[("t1", "imported")]), &[("b", 1)]);
    let edit = task_op("b", OpType::Update, "t1", json!({"title": "edited"}), &[("b", 2)]);

    let outcome = replica.engine.pipeline().process_remote_ops(vec![edit, import]).await.unwrap();
    assert_eq!(outcome.applied, 2);
    assert_eq!(replica.title("t1").await.as_deref(), Some("edited"));
}

#[tokio::test]
async fn own_synced_ops_newer_than_the_import_are_replayed() {
    let replica = Replica::new("a");
    // Authored before the local edits, downloaded after them.
    let import = import_from("b", tasks(&[("t1", "imported")]), &[("b", 1)]);

    let created = replica.engine.record_local_operation(create_task("t2", "mine")).await.unwrap();
    let entry = replica.store.get_op_by_id(&created.id).await.unwrap().unwrap();
    replica.store.mark_synced(&[entry.seq]).await.unwrap();
    assert!(created.id > import.id);

    replica.engine.pipeline().process_remote_ops(vec![import]).await.unwrap();
    assert_eq!(replica.title("t1").await.as_deref(), Some("imported"));
    assert_eq!(replica.title("t2").await.as_deref(), Some("mine"));
}

#[tokio::test]
async fn replay_skips_ops_on_entities_the_import_removed() {
    let replica = Replica::new("a");
    let import = import_from("b", tasks(&[]), &[("b", 1)]);
    let update = task_op("a", OpType::Update, "gone", json!({"title": "orphan"}), &[("a", 1)]);
    append_synced(&replica, &update).await;

    let replayed = replica.engine.pipeline().imports().replay_own_ops(&import).await;
    assert_eq!(replayed, 0);
    assert_eq!(replica.title("gone").await, None);
}

#[tokio::test]
async fn replay_keeps_create_update_delete_chain() {
    let replica = Replica::new("a");
    let import = import_from("b", tasks(&[]), &[("b", 1)]);
    let chain = [
        task_op("a", OpType::Create, "t4", json!({"title": "new"}), &[("a", 1)]),
        task_op("a", OpType::Update, "t4", json!({"title": "edited"}), &[("a", 2)]),
        task_op("a", OpType::Delete, "t4", Value::Null, &[("a", 3)]),
    ];
    for op in &chain {
        append_synced(&replica, op).await;
    }

    let replayed = replica.engine.pipeline().imports().replay_own_ops(&import).await;
    assert_eq!(replayed, 3);
    assert_eq!(replica.title("t4").await, None);
}

#[tokio::test]
async fn unsynced_own_ops_are_not_replayed() {
    let replica = Replica::new("a");
    let import = import_from("b", tasks(&[]), &[("b", 1)]);
    let create = task_op("a", OpType::Create, "t5", json!({"title": "unsynced"}), &[("a", 1)]);
    replica.store.append(&create, OpSource::Local, false).await.unwrap();
    assert!(create.id > import.id);

    let replayed = replica.engine.pipeline().imports().replay_own_ops(&import).await;
    assert_eq!(replayed, 0);
    assert_eq!(replica.title("t5").await, None);
}
