use oplog_clock::VectorClock;
use oplog_model::{OpSource, OpType, Operation, Snapshot};
use oplog_store::{MemoryOpLogStore, OpLogStore, VectorClockStore};
use oplog_types::{ClientId, EntityKey, EntityType};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

fn clock(entries: &[(&str, u64)]) -> VectorClock {
    entries.iter().map(|(k, v)| (*k, *v)).collect()
}

fn make_op(client: &str, entity: &str, vc: &[(&str, u64)]) -> Operation {
    Operation::new(ClientId::from(client), OpType::Update, EntityType::Task, entity, json!({}), clock(vc))
}

fn make_stores() -> (Arc<MemoryOpLogStore>, VectorClockStore) {
    let store = Arc::new(MemoryOpLogStore::new());
    let clocks = VectorClockStore::new(store.clone());
    (store, clocks)
}

fn snapshot(vc: VectorClock, keys: &[&str], last_applied_seq: u64) -> Snapshot {
    Snapshot {
        vector_clock: vc,
        entity_keys: Some(keys.iter().map(|k| EntityKey::new(EntityType::Task, *k)).collect()),
        last_applied_seq,
        state: json!({}),
        compacted_at: 0,
        schema_version: 1,
    }
}

#[tokio::test]
async fn current_clock_rebuilds_from_snapshot_and_tail() {
    let (store, clocks) = make_stores();
    store.save_snapshot(&snapshot(clock(&[("a", 5)]), &["t1"], 0)).await.unwrap();
    store.append(&make_op("b", "t2", &[("b", 2)]), OpSource::Remote, false).await.unwrap();

    assert_eq!(clocks.current_clock().await.unwrap(), clock(&[("a", 5), ("b", 2)]));
}

#[tokio::test]
async fn next_local_clock_increments_and_persists() {
    let (store, clocks) = make_stores();
    let me = ClientId::from("me");
    assert_eq!(clocks.next_local_clock(&me).await.unwrap(), clock(&[("me", 1)]));
    assert_eq!(clocks.next_local_clock(&me).await.unwrap(), clock(&[("me", 2)]));
    assert_eq!(store.load_vector_clock().await.unwrap(), Some(clock(&[("me", 2)])));
}

#[tokio::test]
async fn merge_remote_clocks_dominates_remote_ops() {
    let (_store, clocks) = make_stores();
    let me = ClientId::from("me");
    clocks.next_local_clock(&me).await.unwrap();
    let remote = make_op("b", "t1", &[("b", 7), ("c", 1)]);
    clocks.merge_remote_clocks(std::slice::from_ref(&remote)).await.unwrap();

    let next = clocks.next_local_clock(&me).await.unwrap();
    assert!(next.is_after(&remote.vector_clock));
}

#[tokio::test]
async fn merge_clock_folds_server_snapshot_clock() {
    let (_store, clocks) = make_stores();
    clocks.merge_clock(&clock(&[("srv", 9)])).await.unwrap();
    assert_eq!(clocks.current_clock().await.unwrap().get(&ClientId::from("srv")), 9);
}

#[tokio::test]
async fn full_clock_includes_every_log_entry() {
    let (store, clocks) = make_stores();
    store.save_snapshot(&snapshot(clock(&[("a", 100)]), &["t1"], 10)).await.unwrap();
    store.append(&make_op("b", "t2", &[("b", 10)]), OpSource::Remote, false).await.unwrap();
    store.append(&make_op("c", "t3", &[("c", 3)]), OpSource::Remote, false).await.unwrap();

    assert_eq!(clocks.full_clock().await.unwrap(), clock(&[("a", 100), ("b", 10), ("c", 3)]));
    assert_eq!(clocks.snapshot_clock().await.unwrap(), clock(&[("a", 100)]));
}

#[tokio::test]
async fn entity_frontier_skips_rejected_and_pending() {
    let (store, clocks) = make_stores();
    let applied = make_op("b", "t1", &[("b", 1)]);
    let rejected = make_op("a", "t1", &[("a", 4)]);
    let pending = make_op("c", "t1", &[("c", 2)]);
    store.append(&applied, OpSource::Remote, false).await.unwrap();
    store.append(&rejected, OpSource::Local, false).await.unwrap();
    store.append(&pending, OpSource::Remote, true).await.unwrap();
    store.mark_rejected(&[rejected.id]).await.unwrap();

    let frontier = clocks.entity_frontier().await.unwrap();
    assert_eq!(frontier[&EntityKey::new(EntityType::Task, "t1")], clock(&[("b", 1)]));
}

#[tokio::test]
async fn settled_frontier_skips_local_ops_awaiting_upload() {
    let (store, clocks) = make_stores();
    let key = EntityKey::new(EntityType::Task, "t1");
    let remote = make_op("b", "t1", &[("b", 1)]);
    let uploaded = make_op("a", "t1", &[("a", 1), ("b", 1)]);
    let unsynced = make_op("a", "t1", &[("a", 2), ("b", 1)]);
    store.append(&remote, OpSource::Remote, false).await.unwrap();
    let uploaded_seq = store.append(&uploaded, OpSource::Local, false).await.unwrap();
    store.append(&unsynced, OpSource::Local, false).await.unwrap();
    store.mark_synced(&[uploaded_seq]).await.unwrap();

    assert_eq!(clocks.entity_frontier().await.unwrap()[&key], clock(&[("a", 2), ("b", 1)]));
    assert_eq!(clocks.settled_frontier().await.unwrap()[&key], clock(&[("a", 1), ("b", 1)]));
}

#[tokio::test]
async fn snapshot_entity_keys_none_without_snapshot() {
    let (store, clocks) = make_stores();
    assert!(clocks.snapshot_entity_keys().await.unwrap().is_none());
    store.save_snapshot(&snapshot(clock(&[("a", 1)]), &["t1", "t2"], 0)).await.unwrap();
    assert_eq!(clocks.snapshot_entity_keys().await.unwrap().map(|k| k.len()), Some(2));
}
