//! Handling operations the server refused.

use crate::context::SyncContext;
use crate::domain::SyncNotice;
use crate::error::SyncResult;
use crate::provider::{ErrorCode, RejectedOp};
use crate::stale::StaleOperationResolver;
use async_trait::async_trait;
use oplog_clock::VectorClock;
use oplog_model::Operation;
use oplog_types::OpId;
use tracing::{error, info, warn};

/// What a download triggered by a rejection produced.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct DownloadOutcome {
    pub new_ops: usize,
    /// Clocks of every downloaded op. Filled only by forced downloads.
    pub all_op_clocks: Vec<VectorClock>,
    pub snapshot_vector_clock: Option<VectorClock>,
    /// Local-win operations created while processing the download.
    pub local_win_ops_created: usize,
}

/// Lets the handler trigger a download without owning the engine.
#[async_trait]
pub trait DownloadCallback: Send + Sync {
    async fn download(&self, force_from_seq0: bool) -> SyncResult<DownloadOutcome>;
}

/// Result of [`RejectedOpsHandler::handle_rejected_ops`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RejectionOutcome {
    pub permanently_rejected: usize,
    /// Kept for a later upload (quota, transient server errors).
    pub kept_for_retry: usize,
    /// New operations created to settle concurrent modifications.
    pub merged_ops_created: usize,
}

pub struct RejectedOpsHandler {
    ctx: SyncContext,
    stale: StaleOperationResolver,
}

impl RejectedOpsHandler {
    pub fn new(ctx: SyncContext) -> Self {
        let stale = StaleOperationResolver::new(ctx.clone());
        Self { ctx, stale }
    }

    /// Classifies rejections and acts on them.
    ///
    /// - storage quota: notify, keep the op
    /// - internal error: transient, keep the op
    /// - concurrent modification: download and re-resolve
    /// - anything else: permanent, mark rejected
    ///
    /// Ops that are already synced or rejected locally are ignored.
    pub async fn handle_rejected_ops(
        &self,
        rejected: &[RejectedOp],
        download: &dyn DownloadCallback,
    ) -> SyncResult<RejectionOutcome> {
        let mut outcome = RejectionOutcome::default();
        let mut permanent: Vec<OpId> = Vec::new();
        let mut concurrent: Vec<Operation> = Vec::new();
        let mut quota_notified = false;

        for r in rejected {
            match r.error_code {
                Some(ErrorCode::StorageQuotaExceeded) => {
                    error!("server storage quota exceeded, op {} not synced", r.op_id);
                    if !quota_notified {
                        self.ctx.notifier.notify(SyncNotice::StorageQuotaExceeded);
                        quota_notified = true;
                    }
                    outcome.kept_for_retry += 1;
                    continue;
                }
                Some(ErrorCode::InternalError) => {
                    warn!(
                        "transient server error for {}, will retry: {}",
                        r.op_id,
                        r.error.as_deref().unwrap_or("unknown")
                    );
                    outcome.kept_for_retry += 1;
                    continue;
                }
                _ => {}
            }

            let Some(entry) = self.ctx.store.get_op_by_id(&r.op_id).await? else {
                continue;
            };
            if entry.is_synced() || entry.is_rejected() {
                continue;
            }
            if r.error_code == Some(ErrorCode::ConcurrentModification) {
                warn!("concurrent modification of {:?}, resolving after download", entry.op.entity_keys());
                concurrent.push(entry.op);
            } else {
                info!(
                    "server rejected {}: {}",
                    r.op_id,
                    r.error.as_deref().unwrap_or("unknown error")
                );
                permanent.push(r.op_id);
            }
        }

        if !permanent.is_empty() {
            self.ctx.store.mark_rejected(&permanent).await?;
            outcome.permanently_rejected = permanent.len();
            if permanent.len() >= self.ctx.config.max_rejected_ops_before_warning {
                self.ctx.notifier.notify(SyncNotice::OpsRejected {
                    count: permanent.len(),
                });
            }
        }

        if !concurrent.is_empty() {
            outcome.merged_ops_created = self.resolve_concurrent(concurrent, download).await;
        }
        Ok(outcome)
    }

    async fn still_pending(&self, ops: &[Operation]) -> SyncResult<Vec<Operation>> {
        let mut pending = Vec::new();
        for op in ops {
            if let Some(entry) = self.ctx.store.get_op_by_id(&op.id).await? {
                if !entry.is_synced() && !entry.is_rejected() {
                    pending.push(entry.op);
                }
            }
        }
        Ok(pending)
    }

    /// Downloads, then re-publishes whatever the download did not settle.
    /// Failures are logged and leave the ops pending for the next cycle.
    async fn resolve_concurrent(&self, ops: Vec<Operation>, download: &dyn DownloadCallback) -> usize {
        match self.try_resolve_concurrent(&ops, download).await {
            Ok(created) => created,
            Err(e) => {
                error!("resolving {} concurrent modifications failed: {e}", ops.len());
                self.ctx.notifier.notify(SyncNotice::ConflictResolutionFailed {
                    reason: e.to_string(),
                });
                0
            }
        }
    }

    async fn try_resolve_concurrent(
        &self,
        ops: &[Operation],
        download: &dyn DownloadCallback,
    ) -> SyncResult<usize> {
        warn!("{} ops had concurrent modifications, downloading", ops.len());
        let first = download.download(false).await?;
        let mut created = first.local_win_ops_created;

        let pending = self.still_pending(ops).await?;
        if pending.is_empty() {
            return Ok(created);
        }

        if first.new_ops > 0 {
            info!(
                "download brought {} ops but {} concurrent ops are still pending",
                first.new_ops,
                pending.len()
            );
            created += self
                .stale
                .resolve_stale_local_ops(&pending, &[], first.snapshot_vector_clock.as_ref())
                .await?;
            return Ok(created);
        }

        warn!("no new ops but {} concurrent ops still pending, forcing full download", pending.len());
        let forced = download.download(true).await?;
        created += forced.local_win_ops_created;
        let pending = self.still_pending(&pending).await?;
        if pending.is_empty() {
            return Ok(created);
        }

        if forced.all_op_clocks.is_empty() && forced.snapshot_vector_clock.is_none() {
            error!(
                "forced download returned no clocks, rejecting {} concurrent ops",
                pending.len()
            );
            let ids: Vec<OpId> = pending.iter().map(|op| op.id).collect();
            self.ctx.store.mark_rejected(&ids).await?;
            self.ctx.notifier.notify(SyncNotice::ConflictResolutionFailed {
                reason: format!("no server clocks to resolve {} operations", ids.len()),
            });
            return Ok(created);
        }

        created += self
            .stale
            .resolve_stale_local_ops(
                &pending,
                &forced.all_op_clocks,
                forced.snapshot_vector_clock.as_ref(),
            )
            .await?;
        Ok(created)
    }
}
