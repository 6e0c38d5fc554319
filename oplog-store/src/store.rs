//! The operation log persistence contract.

use crate::StorageResult;
use async_trait::async_trait;
use oplog_clock::VectorClock;
use oplog_model::{ApplicationStatus, OpSource, Operation, OperationLogEntry, Snapshot};
use oplog_types::{EntityKey, OpId};
use std::collections::HashMap;

/// Append-only, sequence-numbered operation store.
///
/// Entries are mutated only through status transitions and removed only by
/// [`OpLogStore::delete_compactable`]. Remote entries are recorded as synced
/// when appended.
#[async_trait]
pub trait OpLogStore: Send + Sync {
    /// Appends an operation and returns its sequence number.
    ///
    /// Appending an id that is already stored returns the existing sequence
    /// number and changes nothing.
    async fn append(
        &self,
        op: &Operation,
        source: OpSource,
        pending_apply: bool,
    ) -> StorageResult<u64>;

    /// Whether an operation with this id is stored.
    async fn has_op(&self, id: &OpId) -> StorageResult<bool>;

    /// Returns the operations whose ids are not stored yet, in input order.
    async fn filter_new_ops(&self, ops: &[Operation]) -> StorageResult<Vec<Operation>> {
        let mut fresh = Vec::with_capacity(ops.len());
        for op in ops {
            if !self.has_op(&op.id).await? {
                fresh.push(op.clone());
            }
        }
        Ok(fresh)
    }

    async fn get_op_by_id(&self, id: &OpId) -> StorageResult<Option<OperationLogEntry>>;

    /// Marks entries applied and clears their pending-apply flag.
    async fn mark_applied(&self, seqs: &[u64]) -> StorageResult<()>;

    /// Marks entries failed and bumps their retry count. Entries whose
    /// retry count exceeds `max_retries` are rejected.
    async fn mark_failed(&self, ids: &[OpId], max_retries: u32) -> StorageResult<()>;

    async fn mark_synced(&self, seqs: &[u64]) -> StorageResult<()>;

    async fn mark_rejected(&self, ids: &[OpId]) -> StorageResult<()>;

    /// Local entries neither synced nor rejected, in sequence order.
    async fn get_unsynced(&self) -> StorageResult<Vec<OperationLogEntry>>;

    /// Unsynced entries grouped by every entity key they touch.
    async fn get_unsynced_by_entity(
        &self,
    ) -> StorageResult<HashMap<EntityKey, Vec<OperationLogEntry>>> {
        let mut grouped: HashMap<EntityKey, Vec<OperationLogEntry>> = HashMap::new();
        for entry in self.get_unsynced().await? {
            for key in entry.op.entity_keys() {
                grouped.entry(key).or_default().push(entry.clone());
            }
        }
        Ok(grouped)
    }

    /// Every entry touching `key`, in sequence order.
    async fn get_by_entity(&self, key: &EntityKey) -> StorageResult<Vec<OperationLogEntry>>;

    async fn get_by_status(
        &self,
        status: ApplicationStatus,
    ) -> StorageResult<Vec<OperationLogEntry>>;

    /// Entries with `seq > after`, in sequence order.
    async fn get_ops_after_seq(&self, after: u64) -> StorageResult<Vec<OperationLogEntry>>;

    /// Entries stored but never confirmed applied.
    async fn get_pending_apply(&self) -> StorageResult<Vec<OperationLogEntry>>;

    /// Highest sequence number ever assigned (0 when nothing was appended).
    async fn last_seq(&self) -> StorageResult<u64>;

    /// Latest non-rejected full-state operation by id.
    async fn latest_full_state_op(&self) -> StorageResult<Option<Operation>> {
        let latest = self
            .get_ops_after_seq(0)
            .await?
            .into_iter()
            .filter(|e| e.op.is_full_state() && !e.is_rejected())
            .map(|e| e.op)
            .max_by_key(|op| op.id);
        Ok(latest)
    }

    /// Deletes entries with `seq <= up_to_seq` that are settled (synced and
    /// applied, or rejected), not pending apply, and whose last status change
    /// happened before `settled_before`. Returns the number deleted.
    async fn delete_compactable(&self, up_to_seq: u64, settled_before: i64)
    -> StorageResult<usize>;

    async fn load_vector_clock(&self) -> StorageResult<Option<VectorClock>>;

    async fn save_vector_clock(&self, clock: &VectorClock) -> StorageResult<()>;

    async fn load_snapshot(&self) -> StorageResult<Option<Snapshot>>;

    async fn save_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()>;
}

/// Shared compaction predicate for every store implementation.
pub(crate) fn is_compactable(entry: &OperationLogEntry, up_to_seq: u64, settled_before: i64) -> bool {
    if entry.seq > up_to_seq || entry.pending_apply {
        return false;
    }
    let settled_at = if let Some(rejected_at) = entry.rejected_at {
        rejected_at
    } else if entry.is_synced() && entry.application_status == ApplicationStatus::Applied {
        entry.applied_at.unwrap_or(0).max(entry.synced_at.unwrap_or(0))
    } else {
        return false;
    };
    settled_at < settled_before
}
