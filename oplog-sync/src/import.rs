//! Full-state imports (`SYNC_IMPORT`, `BACKUP_IMPORT`, `REPAIR`).
//!
//! An import replaces the whole document graph. Foreign operations authored
//! without knowledge of the import describe entities the import wiped, so
//! they are filtered by causality. The client's own operations created after
//! the import (by id) are replayed on top of it, which is how a replica that
//! joins late keeps work it already uploaded.

use crate::applier::{ApplyOptions, OperationApplier};
use crate::context::SyncContext;
use crate::dependency::sort_by_dependency;
use crate::domain::SyncNotice;
use crate::error::SyncResult;
use oplog_clock::CausalOrder;
use oplog_model::{OpSource, OpType, Operation};
use oplog_types::{EntityKey, OpId};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Result of [`FullStateImportHandler::filter_invalidated`].
#[derive(Debug, Default, Clone)]
pub struct ImportFilterResult {
    pub valid: Vec<Operation>,
    /// Operations authored without knowledge of the latest import.
    pub invalidated: Vec<Operation>,
    /// The latest import known, from the batch or the local log.
    pub latest_import: Option<Operation>,
    /// Whether `latest_import` arrived in this batch.
    pub import_in_batch: bool,
}

/// Result of [`FullStateImportHandler::apply_import_batch`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportOutcome {
    pub applied: usize,
    pub rejected_local: usize,
    pub replayed: usize,
}

pub struct FullStateImportHandler {
    ctx: SyncContext,
    applier: OperationApplier,
}

impl FullStateImportHandler {
    pub fn new(ctx: SyncContext, applier: OperationApplier) -> Self {
        Self { ctx, applier }
    }

    /// Splits a batch into operations that survive the latest import and
    /// operations it invalidated.
    ///
    /// The latest import by id across the batch and the local log is the
    /// boundary. Every other operation whose clock is before or concurrent
    /// to the import's clock is discarded, older imports included.
    pub async fn filter_invalidated(&self, ops: Vec<Operation>) -> SyncResult<ImportFilterResult> {
        let batch_latest = ops.iter().filter(|op| op.is_full_state()).max_by_key(|op| op.id);
        let stored_latest = self.ctx.store.latest_full_state_op().await?;

        let (latest, import_in_batch) = match (batch_latest, stored_latest) {
            (Some(batch), Some(stored)) if stored.id > batch.id => (stored, false),
            (Some(batch), _) => (batch.clone(), true),
            (None, Some(stored)) => (stored, false),
            (None, None) => {
                return Ok(ImportFilterResult {
                    valid: ops,
                    ..Default::default()
                });
            }
        };

        let mut result = ImportFilterResult::default();
        for op in ops {
            if op.id == latest.id {
                result.valid.push(op);
                continue;
            }
            match op.vector_clock.compare(&latest.vector_clock) {
                CausalOrder::Before | CausalOrder::Concurrent => result.invalidated.push(op),
                CausalOrder::After | CausalOrder::Equal => result.valid.push(op),
            }
        }
        if !result.invalidated.is_empty() {
            warn!(
                "discarded {} operations invalidated by import {}",
                result.invalidated.len(),
                latest.id
            );
        }
        result.latest_import = Some(latest);
        result.import_in_batch = import_in_batch;
        Ok(result)
    }

    /// Applies a batch containing an import, bypassing conflict detection.
    ///
    /// The import goes first. Pending local operations that do not follow
    /// it are rejected, the rest of the batch is applied, then the client's
    /// own operations are replayed. Callers hold the operation-log lock.
    pub async fn apply_import_batch(
        &self,
        valid: Vec<Operation>,
        import: &Operation,
    ) -> SyncResult<ImportOutcome> {
        info!("applying full-state import {} from {}", import.id, import.client_id);
        let mut outcome = ImportOutcome::default();

        let (imports, rest): (Vec<_>, Vec<_>) =
            valid.into_iter().partition(|op| op.id == import.id);
        outcome.applied += self
            .applier
            .store_and_apply(imports, ApplyOptions::default())
            .await?
            .len();

        outcome.rejected_local = self.reject_pending_before(import).await?;

        let opts = ApplyOptions {
            is_local_hydration: false,
            latest_import_op_id: Some(import.id),
        };
        outcome.applied += self.applier.store_and_apply(rest, opts).await?.len();

        outcome.replayed = self.replay_own_ops(import).await;
        self.ctx.checkpoint("full-state import").await;
        Ok(outcome)
    }

    async fn reject_pending_before(&self, import: &Operation) -> SyncResult<usize> {
        let stale: Vec<OpId> = self
            .ctx
            .store
            .get_unsynced()
            .await?
            .into_iter()
            .filter(|e| e.op.vector_clock.compare(&import.vector_clock) != CausalOrder::After)
            .map(|e| e.op.id)
            .collect();
        if !stale.is_empty() {
            info!("rejecting {} pending local operations superseded by import", stale.len());
            self.ctx.store.mark_rejected(&stale).await?;
        }
        Ok(stale.len())
    }

    /// Re-applies the client's own operations created after `import`.
    ///
    /// Eligible: local, already accepted by the server, not rejected, not a
    /// full-state op, id greater than the import's, and targeting an entity
    /// that exists after the import or was created earlier in the same
    /// replay. Failure is logged and
    /// notified, never raised. Returns the number of replayed operations.
    pub async fn replay_own_ops(&self, import: &Operation) -> usize {
        match self.replay_candidates(import).await {
            Ok(candidates) if candidates.is_empty() => 0,
            Ok(candidates) => {
                let count = candidates.len();
                let result = self
                    .applier
                    .apply(&sort_by_dependency(candidates), ApplyOptions::hydration())
                    .await;
                match result.failed {
                    None => {
                        info!("replayed {count} own operations after import {}", import.id);
                        result.applied_ops.len()
                    }
                    Some(failed) => {
                        self.replay_failed(format!("{} failed: {}", failed.op.id, failed.error))
                            .await;
                        result.applied_ops.len()
                    }
                }
            }
            Err(e) => {
                self.replay_failed(e.to_string()).await;
                0
            }
        }
    }

    async fn replay_failed(&self, reason: String) {
        warn!("replay of own operations after import failed: {reason}");
        self.ctx.checkpoint("import replay failure").await;
        self.ctx.notifier.notify(SyncNotice::ReplayFailed { reason });
    }

    async fn replay_candidates(&self, import: &Operation) -> SyncResult<Vec<Operation>> {
        let mut own: Vec<Operation> = self
            .ctx
            .store
            .get_ops_after_seq(0)
            .await?
            .into_iter()
            .filter(|e| {
                e.source == OpSource::Local
                    && e.is_synced()
                    && !e.is_rejected()
                    && !e.op.is_full_state()
                    && e.op.id > import.id
            })
            .map(|e| e.op)
            .collect();
        own.sort_by_key(|op| op.id);

        let mut created: HashSet<EntityKey> = HashSet::new();
        let mut eligible = Vec::with_capacity(own.len());
        for op in own {
            let keys = op.entity_keys();
            if op.op_type == OpType::Create {
                created.extend(keys);
                eligible.push(op);
                continue;
            }
            let mut targets_present = true;
            for key in &keys {
                if !created.contains(key) && !self.ctx.domain.entity_exists(key).await? {
                    targets_present = false;
                    break;
                }
            }
            if targets_present {
                eligible.push(op);
            } else {
                debug!("not replaying {}: target missing after import", op.id);
            }
        }
        Ok(eligible)
    }
}
