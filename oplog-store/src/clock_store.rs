//! Causal frontier bookkeeping on top of an [`OpLogStore`].

use crate::{OpLogStore, StorageResult};
use oplog_clock::VectorClock;
use oplog_model::{Operation, OperationLogEntry};
use oplog_types::{ClientId, EntityKey};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Persists and serves the replica's causal frontier.
#[derive(Clone)]
pub struct VectorClockStore {
    store: Arc<dyn OpLogStore>,
}

impl VectorClockStore {
    pub fn new(store: Arc<dyn OpLogStore>) -> Self {
        Self { store }
    }

    /// The persisted global clock.
    ///
    /// When nothing is persisted yet the clock is rebuilt from the snapshot
    /// clock plus every operation after the snapshot.
    pub async fn current_clock(&self) -> StorageResult<VectorClock> {
        if let Some(clock) = self.store.load_vector_clock().await? {
            return Ok(clock);
        }
        let snapshot = self.store.load_snapshot().await?;
        let after = snapshot.as_ref().map_or(0, |s| s.last_applied_seq);
        let mut clock = snapshot.map(|s| s.vector_clock).unwrap_or_default();
        for entry in self.store.get_ops_after_seq(after).await? {
            clock.merge(&entry.op.vector_clock);
        }
        debug!("rebuilt global vector clock {clock}");
        Ok(clock)
    }

    /// Snapshot clock merged with every operation clock still in the log.
    pub async fn full_clock(&self) -> StorageResult<VectorClock> {
        let mut clock = self.snapshot_clock().await?;
        for entry in self.store.get_ops_after_seq(0).await? {
            clock.merge(&entry.op.vector_clock);
        }
        Ok(clock)
    }

    /// Clock of the latest snapshot, empty when there is none.
    pub async fn snapshot_clock(&self) -> StorageResult<VectorClock> {
        Ok(self
            .store
            .load_snapshot()
            .await?
            .map(|s| s.vector_clock)
            .unwrap_or_default())
    }

    /// Entity keys recorded by the latest snapshot. `None` when there is no
    /// snapshot or it predates key recording.
    pub async fn snapshot_entity_keys(&self) -> StorageResult<Option<BTreeSet<EntityKey>>> {
        Ok(self.store.load_snapshot().await?.and_then(|s| s.entity_keys))
    }

    /// Merge of the clocks of applied, non-rejected entries per entity.
    pub async fn entity_frontier(&self) -> StorageResult<HashMap<EntityKey, VectorClock>> {
        self.frontier_where(|_| true).await
    }

    /// Like [`entity_frontier`](Self::entity_frontier), without local entries
    /// still waiting for upload.
    pub async fn settled_frontier(&self) -> StorageResult<HashMap<EntityKey, VectorClock>> {
        self.frontier_where(|entry| !entry.is_pending_upload()).await
    }

    async fn frontier_where(
        &self,
        keep: impl Fn(&OperationLogEntry) -> bool,
    ) -> StorageResult<HashMap<EntityKey, VectorClock>> {
        let mut frontier: HashMap<EntityKey, VectorClock> = HashMap::new();
        for entry in self.store.get_ops_after_seq(0).await? {
            if entry.is_rejected() || entry.pending_apply || entry.applied_at.is_none() || !keep(&entry) {
                continue;
            }
            for key in entry.op.entity_keys() {
                frontier.entry(key).or_default().merge(&entry.op.vector_clock);
            }
        }
        Ok(frontier)
    }

    /// Increments the global clock for `client`, persists and returns it.
    pub async fn next_local_clock(&self, client: &ClientId) -> StorageResult<VectorClock> {
        let next = self.current_clock().await?.incremented(client);
        self.store.save_vector_clock(&next).await?;
        Ok(next)
    }

    /// Folds applied remote clocks into the global clock.
    pub async fn merge_remote_clocks(&self, ops: &[Operation]) -> StorageResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut clock = self.current_clock().await?;
        for op in ops {
            clock.merge(&op.vector_clock);
        }
        self.store.save_vector_clock(&clock).await
    }

    /// Folds a single clock (for example a server snapshot clock) into the
    /// global clock.
    pub async fn merge_clock(&self, other: &VectorClock) -> StorageResult<()> {
        let clock = self.current_clock().await?.merged(other);
        self.store.save_vector_clock(&clock).await
    }
}
