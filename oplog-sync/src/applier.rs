//! Applying operations to domain state.
//!
//! [`OperationApplier::apply`] is fail-fast: it stops at the first failure
//! and reports what was applied before it. [`OperationApplier::store_and_apply`]
//! wraps it in the crash-safe sequence: append with `pending_apply`, apply,
//! then mark applied.

use crate::context::SyncContext;
use crate::dependency::{sort_by_dependency, DependencyResolver};
use crate::domain::SyncNotice;
use crate::error::{SyncError, SyncResult};
use oplog_model::{OpSource, Operation};
use oplog_types::OpId;
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Replaying the client's own, previously validated operations; skips
    /// dependency checks.
    pub is_local_hydration: bool,
    /// Latest full-state import applied locally. Operations older than it
    /// whose dependencies are missing are skipped instead of failing.
    pub latest_import_op_id: Option<OpId>,
}

impl ApplyOptions {
    #[must_use]
    pub fn hydration() -> Self {
        Self {
            is_local_hydration: true,
            latest_import_op_id: None,
        }
    }
}

/// The operation that stopped a batch.
#[derive(Debug)]
pub struct FailedOp {
    pub op: Operation,
    pub error: SyncError,
}

#[derive(Debug, Default)]
pub struct ApplyResult {
    pub applied_ops: Vec<Operation>,
    /// Operations skipped because an import made them obsolete.
    pub skipped_ops: Vec<Operation>,
    pub failed: Option<FailedOp>,
}

impl ApplyResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed.is_none()
    }
}

#[derive(Clone)]
pub struct OperationApplier {
    ctx: SyncContext,
    deps: DependencyResolver,
}

impl OperationApplier {
    pub fn new(ctx: SyncContext) -> Self {
        let deps = DependencyResolver::new(ctx.domain.clone());
        Self { ctx, deps }
    }

    /// Applies operations in order, stopping at the first failure.
    pub async fn apply(&self, ops: &[Operation], opts: ApplyOptions) -> ApplyResult {
        let mut result = ApplyResult::default();
        for op in ops {
            if !opts.is_local_hydration {
                let check = match self
                    .deps
                    .check_dependencies(&DependencyResolver::extract_dependencies(op))
                    .await
                {
                    Ok(check) => check,
                    Err(error) => {
                        result.failed = Some(FailedOp { op: op.clone(), error });
                        return result;
                    }
                };
                if !check.is_satisfied() {
                    let missing: Vec<String> =
                        check.missing_hard().map(|d| d.key().to_string()).collect();
                    if opts.latest_import_op_id.is_some_and(|import| op.id < import) {
                        debug!("skipping {} from before the latest import (missing {missing:?})", op.id);
                        result.skipped_ops.push(op.clone());
                        continue;
                    }
                    result.failed = Some(FailedOp {
                        op: op.clone(),
                        error: SyncError::StateCorrupted {
                            op_id: op.id.to_string(),
                            reason: format!("missing hard dependencies {missing:?}"),
                        },
                    });
                    return result;
                }
            }

            if let Err(error) = self.ctx.domain.apply_operation(op).await {
                result.failed = Some(FailedOp { op: op.clone(), error });
                return result;
            }
            result.applied_ops.push(op.clone());
        }
        result
    }

    /// Stores remote operations, applies them in dependency order and
    /// records the outcome.
    ///
    /// On failure the failing operation and everything after it are marked
    /// failed, a validation checkpoint runs, the user is notified and the
    /// error is returned.
    pub async fn store_and_apply(
        &self,
        ops: Vec<Operation>,
        opts: ApplyOptions,
    ) -> SyncResult<Vec<Operation>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let ops = sort_by_dependency(ops);

        let mut seqs: HashMap<OpId, u64> = HashMap::with_capacity(ops.len());
        for op in &ops {
            let seq = self.ctx.store.append(op, OpSource::Remote, true).await?;
            seqs.insert(op.id, seq);
        }

        let result = self.apply(&ops, opts).await;

        let applied_seqs: Vec<u64> = result
            .applied_ops
            .iter()
            .filter_map(|op| seqs.get(&op.id).copied())
            .collect();
        self.ctx.store.mark_applied(&applied_seqs).await?;
        self.ctx.clocks.merge_remote_clocks(&result.applied_ops).await?;

        if !result.skipped_ops.is_empty() {
            let skipped: Vec<OpId> = result.skipped_ops.iter().map(|op| op.id).collect();
            info!("{} operations superseded by an import were skipped", skipped.len());
            self.ctx.store.mark_rejected(&skipped).await?;
        }

        let Some(failed) = result.failed else {
            debug!("applied {} remote operations", result.applied_ops.len());
            return Ok(result.applied_ops);
        };

        let settled = result.applied_ops.len() + result.skipped_ops.len();
        let remaining: Vec<OpId> = ops
            .iter()
            .map(|op| op.id)
            .skip_while(|id| *id != failed.op.id)
            .collect();
        warn!(
            "apply stopped at {} after {settled} operations, marking {} failed: {}",
            failed.op.id,
            remaining.len(),
            failed.error
        );
        self.ctx
            .store
            .mark_failed(&remaining, self.ctx.config.max_conflict_retry_attempts)
            .await?;

        self.ctx.checkpoint("partial apply failure").await;
        if let SyncError::StateCorrupted { reason, .. } = &failed.error {
            error!("state corrupted: {reason}");
            self.ctx.notifier.notify(SyncNotice::StateCorrupted {
                reason: reason.clone(),
            });
        }
        self.ctx.notifier.notify(SyncNotice::PartialApplyFailure {
            applied: result.applied_ops.len(),
            failed_op: failed.op.id,
            reason: failed.error.to_string(),
        });
        Err(failed.error)
    }
}
