//! In-memory operation log.

use crate::store::is_compactable;
use crate::{OpLogStore, StorageResult};
use async_trait::async_trait;
use oplog_clock::VectorClock;
use oplog_model::{ApplicationStatus, OpSource, Operation, OperationLogEntry, Snapshot};
use oplog_types::{now_millis, EntityKey, OpId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    entries: BTreeMap<u64, OperationLogEntry>,
    by_id: HashMap<OpId, u64>,
    last_seq: u64,
    vector_clock: Option<VectorClock>,
    snapshot: Option<Snapshot>,
}

impl Inner {
    fn update_by_id(&mut self, id: &OpId, f: impl FnOnce(&mut OperationLogEntry)) {
        let Some(seq) = self.by_id.get(id).copied() else {
            return;
        };
        if let Some(entry) = self.entries.get_mut(&seq) {
            f(entry);
        }
    }

    fn collect(&self, pred: impl Fn(&OperationLogEntry) -> bool) -> Vec<OperationLogEntry> {
        self.entries.values().filter(|e| pred(*e)).cloned().collect()
    }
}

/// Operation log held in process memory.
///
/// Cloning shares the same underlying log, so several engine components can
/// hold a handle.
#[derive(Clone, Default)]
pub struct MemoryOpLogStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryOpLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored.
    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}

#[async_trait]
impl OpLogStore for MemoryOpLogStore {
    async fn append(
        &self,
        op: &Operation,
        source: OpSource,
        pending_apply: bool,
    ) -> StorageResult<u64> {
        let mut inner = self.inner.write().await;
        if let Some(&seq) = inner.by_id.get(&op.id) {
            return Ok(seq);
        }
        inner.last_seq += 1;
        let seq = inner.last_seq;
        let now = now_millis();
        let entry = OperationLogEntry {
            seq,
            op: op.clone(),
            source,
            applied_at: (!pending_apply).then_some(now),
            synced_at: (source == OpSource::Remote).then_some(now),
            rejected_at: None,
            application_status: if pending_apply {
                ApplicationStatus::Pending
            } else {
                ApplicationStatus::Applied
            },
            pending_apply,
            retry_count: 0,
        };
        inner.by_id.insert(op.id, seq);
        inner.entries.insert(seq, entry);
        Ok(seq)
    }

    async fn has_op(&self, id: &OpId) -> StorageResult<bool> {
        Ok(self.inner.read().await.by_id.contains_key(id))
    }

    async fn get_op_by_id(&self, id: &OpId) -> StorageResult<Option<OperationLogEntry>> {
        let inner = self.inner.read().await;
        Ok(inner.by_id.get(id).and_then(|seq| inner.entries.get(seq)).cloned())
    }

    async fn mark_applied(&self, seqs: &[u64]) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let now = now_millis();
        for seq in seqs {
            if let Some(entry) = inner.entries.get_mut(seq) {
                entry.application_status = ApplicationStatus::Applied;
                entry.applied_at = Some(now);
                entry.pending_apply = false;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, ids: &[OpId], max_retries: u32) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let now = now_millis();
        for id in ids {
            inner.update_by_id(id, |entry| {
                entry.application_status = ApplicationStatus::Failed;
                entry.pending_apply = false;
                entry.retry_count += 1;
                if entry.retry_count > max_retries {
                    entry.rejected_at.get_or_insert(now);
                }
            });
        }
        Ok(())
    }

    async fn mark_synced(&self, seqs: &[u64]) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let now = now_millis();
        for seq in seqs {
            if let Some(entry) = inner.entries.get_mut(seq) {
                entry.synced_at.get_or_insert(now);
            }
        }
        Ok(())
    }

    async fn mark_rejected(&self, ids: &[OpId]) -> StorageResult<()> {
        let mut inner = self.inner.write().await;
        let now = now_millis();
        for id in ids {
            inner.update_by_id(id, |entry| {
                entry.rejected_at.get_or_insert(now);
                entry.pending_apply = false;
            });
        }
        Ok(())
    }

    async fn get_unsynced(&self) -> StorageResult<Vec<OperationLogEntry>> {
        Ok(self.inner.read().await.collect(OperationLogEntry::is_pending_upload))
    }

    async fn get_by_entity(&self, key: &EntityKey) -> StorageResult<Vec<OperationLogEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .collect(|e| e.op.entity_keys().contains(key)))
    }

    async fn get_by_status(
        &self,
        status: ApplicationStatus,
    ) -> StorageResult<Vec<OperationLogEntry>> {
        Ok(self
            .inner
            .read()
            .await
            .collect(|e| e.application_status == status))
    }

    async fn get_ops_after_seq(&self, after: u64) -> StorageResult<Vec<OperationLogEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .range(after.saturating_add(1)..)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn get_pending_apply(&self) -> StorageResult<Vec<OperationLogEntry>> {
        Ok(self.inner.read().await.collect(|e| e.pending_apply))
    }

    async fn last_seq(&self) -> StorageResult<u64> {
        Ok(self.inner.read().await.last_seq)
    }

    async fn delete_compactable(
        &self,
        up_to_seq: u64,
        settled_before: i64,
    ) -> StorageResult<usize> {
        let mut inner = self.inner.write().await;
        let doomed: Vec<(u64, OpId)> = inner
            .entries
            .values()
            .filter(|e| is_compactable(e, up_to_seq, settled_before))
            .map(|e| (e.seq, e.op.id))
            .collect();
        for (seq, id) in &doomed {
            inner.entries.remove(seq);
            inner.by_id.remove(id);
        }
        Ok(doomed.len())
    }

    async fn load_vector_clock(&self) -> StorageResult<Option<VectorClock>> {
        Ok(self.inner.read().await.vector_clock.clone())
    }

    async fn save_vector_clock(&self, clock: &VectorClock) -> StorageResult<()> {
        self.inner.write().await.vector_clock = Some(clock.clone());
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<Option<Snapshot>> {
        Ok(self.inner.read().await.snapshot.clone())
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()> {
        self.inner.write().await.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
