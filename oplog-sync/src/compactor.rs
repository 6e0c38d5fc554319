//! Log compaction.
//!
//! A snapshot folds the current state together with the merge of every
//! operation clock still in the log, then settled entries are deleted. The
//! snapshot clock must cover every deleted operation, otherwise operations
//! that were already applied would later look concurrent.

use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::lock::LockName;
use oplog_model::Snapshot;
use oplog_types::now_millis;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionReport {
    pub snapshot_seq: u64,
    pub entity_count: usize,
    pub deleted: usize,
}

pub struct Compactor {
    ctx: SyncContext,
    ops_since_compaction: AtomicU64,
}

impl Compactor {
    pub fn new(ctx: SyncContext) -> Self {
        Self {
            ctx,
            ops_since_compaction: AtomicU64::new(0),
        }
    }

    /// Writes a snapshot and deletes settled entries older than the
    /// configured retention.
    pub async fn compact(&self) -> SyncResult<CompactionReport> {
        let _lock = self.ctx.locks.acquire(LockName::OperationLog).await;
        self.compact_locked(self.ctx.config.compaction_retention_ms).await
    }

    /// Compaction with the short retention window, for when storage runs
    /// out. Returns whether it succeeded.
    pub async fn emergency_compact(&self) -> bool {
        let _lock = self.ctx.locks.acquire(LockName::OperationLog).await;
        match self.compact_locked(self.ctx.config.emergency_retention_ms).await {
            Ok(report) => {
                info!("emergency compaction deleted {} entries", report.deleted);
                true
            }
            Err(e) => {
                warn!("emergency compaction failed: {e}");
                false
            }
        }
    }

    /// Counts a local operation and reports whether the threshold was
    /// reached. The counter resets when it is.
    pub fn note_local_op(&self) -> bool {
        let threshold = self.ctx.config.compaction_threshold.max(1);
        let count = self.ops_since_compaction.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= threshold {
            self.ops_since_compaction.store(0, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Compaction body. Callers hold the operation-log lock.
    pub(crate) async fn compact_locked(&self, retention_ms: i64) -> SyncResult<CompactionReport> {
        let store = &self.ctx.store;
        let clock = self.ctx.clocks.full_clock().await?;
        let entity_keys = self.ctx.domain.entity_keys().await?;
        let last_seq = store.last_seq().await?;
        let state = self.ctx.domain.full_state().await?;
        let entity_count = entity_keys.len();

        let snapshot = Snapshot {
            vector_clock: clock.clone(),
            entity_keys: Some(entity_keys),
            last_applied_seq: last_seq,
            state,
            compacted_at: now_millis(),
            schema_version: self.ctx.config.current_schema_version,
        };
        store.save_snapshot(&snapshot).await?;
        self.ctx.clocks.merge_clock(&clock).await?;
        debug!("snapshot at seq {last_seq} with clock {clock}");

        let deleted = store
            .delete_compactable(last_seq, now_millis() - retention_ms)
            .await?;
        self.ops_since_compaction.store(0, Ordering::Relaxed);
        info!("compacted log at seq {last_seq}: {entity_count} entities, {deleted} entries deleted");
        Ok(CompactionReport {
            snapshot_seq: last_seq,
            entity_count,
            deleted,
        })
    }
}
