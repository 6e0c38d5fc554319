use oplog_clock::VectorClock;
use oplog_model::{ApplicationStatus, OpSource, OpType, Operation, Snapshot};
use oplog_store::{MemoryOpLogStore, OpLogStore, SqliteOpLogStore};
use oplog_types::{now_millis, ClientId, EntityKey, EntityType};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

fn clock(entries: &[(&str, u64)]) -> VectorClock {
    entries.iter().map(|(k, v)| (*k, *v)).collect()
}

fn make_op(client: &str, entity: &str, counter: u64) -> Operation {
    Operation::new(
        ClientId::from(client),
        OpType::Update,
        EntityType::Task,
        entity,
        json!({"title": entity}),
        clock(&[(client, counter)]),
    )
}

fn backends() -> Vec<(&'static str, Arc<dyn OpLogStore>)> {
    vec![
        ("memory", Arc::new(MemoryOpLogStore::new())),
        ("sqlite", Arc::new(SqliteOpLogStore::open_in_memory().unwrap())),
    ]
}

// ── Append ──────────────────────────────────────────────────────

#[tokio::test]
async fn append_assigns_increasing_seqs() {
    for (name, store) in backends() {
        let s1 = store.append(&make_op("a", "t1", 1), OpSource::Local, false).await.unwrap();
        let s2 = store.append(&make_op("a", "t2", 2), OpSource::Local, false).await.unwrap();
        assert!(s2 > s1, "{name}");
        assert_eq!(store.last_seq().await.unwrap(), s2, "{name}");
    }
}

#[tokio::test]
async fn append_is_idempotent_per_op_id() {
    for (name, store) in backends() {
        let op = make_op("a", "t1", 1);
        let s1 = store.append(&op, OpSource::Remote, true).await.unwrap();
        let s2 = store.append(&op, OpSource::Remote, true).await.unwrap();
        assert_eq!(s1, s2, "{name}");
        assert_eq!(store.get_ops_after_seq(0).await.unwrap().len(), 1, "{name}");
    }
}

#[tokio::test]
async fn remote_entries_are_synced_on_append() {
    for (name, store) in backends() {
        let op = make_op("b", "t1", 1);
        store.append(&op, OpSource::Remote, true).await.unwrap();
        let entry = store.get_op_by_id(&op.id).await.unwrap().unwrap();
        assert!(entry.is_synced(), "{name}");
        assert!(entry.pending_apply, "{name}");
        assert_eq!(entry.application_status, ApplicationStatus::Pending, "{name}");
        assert!(store.get_unsynced().await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn filter_new_ops_drops_known_ids() {
    for (name, store) in backends() {
        let known = make_op("a", "t1", 1);
        let fresh = make_op("a", "t2", 2);
        store.append(&known, OpSource::Local, false).await.unwrap();
        let filtered = store.filter_new_ops(&[known.clone(), fresh.clone()]).await.unwrap();
        assert_eq!(filtered, vec![fresh], "{name}");
        assert!(store.has_op(&known.id).await.unwrap(), "{name}");
    }
}

// ── Status transitions ──────────────────────────────────────────

#[tokio::test]
async fn mark_applied_clears_pending_flag() {
    for (name, store) in backends() {
        let op = make_op("b", "t1", 1);
        let seq = store.append(&op, OpSource::Remote, true).await.unwrap();
        assert_eq!(store.get_pending_apply().await.unwrap().len(), 1, "{name}");

        store.mark_applied(&[seq]).await.unwrap();
        assert!(store.get_pending_apply().await.unwrap().is_empty(), "{name}");
        let entry = store.get_op_by_id(&op.id).await.unwrap().unwrap();
        assert_eq!(entry.application_status, ApplicationStatus::Applied, "{name}");
        assert!(entry.applied_at.is_some(), "{name}");
    }
}

#[tokio::test]
async fn mark_failed_rejects_after_max_retries() {
    for (name, store) in backends() {
        let op = make_op("b", "t1", 1);
        store.append(&op, OpSource::Remote, true).await.unwrap();

        store.mark_failed(&[op.id], 2).await.unwrap();
        store.mark_failed(&[op.id], 2).await.unwrap();
        let entry = store.get_op_by_id(&op.id).await.unwrap().unwrap();
        assert_eq!(entry.retry_count, 2, "{name}");
        assert!(!entry.is_rejected(), "{name}");
        assert_eq!(store.get_by_status(ApplicationStatus::Failed).await.unwrap().len(), 1);

        store.mark_failed(&[op.id], 2).await.unwrap();
        let entry = store.get_op_by_id(&op.id).await.unwrap().unwrap();
        assert!(entry.is_rejected(), "{name}");
    }
}

#[tokio::test]
async fn synced_and_rejected_entries_leave_unsynced_set() {
    for (name, store) in backends() {
        let a = make_op("a", "t1", 1);
        let b = make_op("a", "t2", 2);
        let c = make_op("a", "t3", 3);
        let sa = store.append(&a, OpSource::Local, false).await.unwrap();
        store.append(&b, OpSource::Local, false).await.unwrap();
        store.append(&c, OpSource::Local, false).await.unwrap();

        store.mark_synced(&[sa]).await.unwrap();
        store.mark_rejected(&[b.id]).await.unwrap();

        let unsynced: Vec<_> = store.get_unsynced().await.unwrap().into_iter().map(|e| e.op.id).collect();
        assert_eq!(unsynced, vec![c.id], "{name}");
    }
}

// ── Queries ─────────────────────────────────────────────────────

#[tokio::test]
async fn get_by_entity_and_unsynced_grouping() {
    for (name, store) in backends() {
        let batch = make_op("a", "t1", 1).with_entity_ids(vec!["t1".into(), "t2".into()]);
        let other = make_op("a", "t3", 2);
        store.append(&batch, OpSource::Local, false).await.unwrap();
        store.append(&other, OpSource::Local, false).await.unwrap();

        let t2 = EntityKey::new(EntityType::Task, "t2");
        let by_entity = store.get_by_entity(&t2).await.unwrap();
        assert_eq!(by_entity.len(), 1, "{name}");
        assert_eq!(by_entity[0].op.id, batch.id, "{name}");

        let grouped = store.get_unsynced_by_entity().await.unwrap();
        assert_eq!(grouped.len(), 3, "{name}");
        assert_eq!(grouped[&t2][0].op.id, batch.id, "{name}");
    }
}

#[tokio::test]
async fn get_ops_after_seq_is_exclusive() {
    for (name, store) in backends() {
        let s1 = store.append(&make_op("a", "t1", 1), OpSource::Local, false).await.unwrap();
        store.append(&make_op("a", "t2", 2), OpSource::Local, false).await.unwrap();
        let after = store.get_ops_after_seq(s1).await.unwrap();
        assert_eq!(after.len(), 1, "{name}");
        assert!(after[0].seq > s1, "{name}");
    }
}

#[tokio::test]
async fn latest_full_state_op_ignores_rejected_imports() {
    for (name, store) in backends() {
        let first = Operation::full_state(ClientId::from("a"), OpType::SyncImport, json!({}), clock(&[("a", 1)]));
        let second = Operation::full_state(ClientId::from("b"), OpType::BackupImport, json!({}), clock(&[("b", 1)]));
        store.append(&first, OpSource::Remote, false).await.unwrap();
        store.append(&second, OpSource::Remote, false).await.unwrap();
        assert_eq!(store.latest_full_state_op().await.unwrap().map(|o| o.id), Some(second.id), "{name}");

        store.mark_rejected(&[second.id]).await.unwrap();
        assert_eq!(store.latest_full_state_op().await.unwrap().map(|o| o.id), Some(first.id), "{name}");
    }
}

// ── Compaction ──────────────────────────────────────────────────

#[tokio::test]
async fn delete_compactable_keeps_unsynced_and_pending() {
    for (name, store) in backends() {
        let synced = make_op("a", "t1", 1);
        let unsynced = make_op("a", "t2", 2);
        let pending = make_op("b", "t3", 1);
        let rejected = make_op("a", "t4", 3);
        let s1 = store.append(&synced, OpSource::Local, false).await.unwrap();
        store.append(&unsynced, OpSource::Local, false).await.unwrap();
        store.append(&pending, OpSource::Remote, true).await.unwrap();
        store.append(&rejected, OpSource::Local, false).await.unwrap();
        store.mark_synced(&[s1]).await.unwrap();
        store.mark_rejected(&[rejected.id]).await.unwrap();

        let last = store.last_seq().await.unwrap();
        let deleted = store.delete_compactable(last, now_millis() + 1_000).await.unwrap();
        assert_eq!(deleted, 2, "{name}");

        let left: Vec<_> = store.get_ops_after_seq(0).await.unwrap().into_iter().map(|e| e.op.id).collect();
        assert_eq!(left, vec![unsynced.id, pending.id], "{name}");
        assert_eq!(store.last_seq().await.unwrap(), last, "{name}");
    }
}

#[tokio::test]
async fn delete_compactable_honours_retention_window() {
    for (name, store) in backends() {
        let seq = store.append(&make_op("b", "t1", 1), OpSource::Remote, false).await.unwrap();
        let deleted = store.delete_compactable(seq, now_millis() - 60_000).await.unwrap();
        assert_eq!(deleted, 0, "{name}");
    }
}

#[tokio::test]
async fn seqs_are_not_reused_after_compaction() {
    for (name, store) in backends() {
        let seq = store.append(&make_op("b", "t1", 1), OpSource::Remote, false).await.unwrap();
        store.delete_compactable(seq, now_millis() + 1_000).await.unwrap();
        let next = store.append(&make_op("b", "t2", 2), OpSource::Remote, false).await.unwrap();
        assert!(next > seq, "{name}");
    }
}

// ── Meta ────────────────────────────────────────────────────────

#[tokio::test]
async fn vector_clock_and_snapshot_persist() {
    for (name, store) in backends() {
        assert!(store.load_vector_clock().await.unwrap().is_none(), "{name}");
        assert!(store.load_snapshot().await.unwrap().is_none(), "{name}");

        let vc = clock(&[("a", 3), ("b", 1)]);
        store.save_vector_clock(&vc).await.unwrap();
        assert_eq!(store.load_vector_clock().await.unwrap(), Some(vc.clone()), "{name}");

        let snapshot = Snapshot {
            vector_clock: vc,
            entity_keys: Some([EntityKey::new(EntityType::Task, "t1")].into_iter().collect()),
            last_applied_seq: 7,
            state: json!({"TASK": {"t1": {"title": "x"}}}),
            compacted_at: 42,
            schema_version: 1,
        };
        store.save_snapshot(&snapshot).await.unwrap();
        assert_eq!(store.load_snapshot().await.unwrap(), Some(snapshot), "{name}");
    }
}

#[tokio::test]
async fn sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("oplog.db");
    let op = make_op("a", "t1", 1);

    {
        let store = SqliteOpLogStore::open(&path).unwrap();
        store.append(&op, OpSource::Local, false).await.unwrap();
        store.save_vector_clock(&clock(&[("a", 1)])).await.unwrap();
    }

    let store = SqliteOpLogStore::open(&path).unwrap();
    let entry = store.get_op_by_id(&op.id).await.unwrap().unwrap();
    assert_eq!(entry.op, op);
    assert_eq!(entry.source, OpSource::Local);
    assert_eq!(store.load_vector_clock().await.unwrap(), Some(clock(&[("a", 1)])));
}
