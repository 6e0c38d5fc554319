//! The remote operations pipeline: migrate, filter by imports, detect
//! conflicts, resolve, apply.

use crate::applier::{ApplyOptions, OperationApplier};
use crate::config::ConflictStrategy;
use crate::context::SyncContext;
use crate::dependency::warn_about_dropped_dependencies;
use crate::detector::ConflictDetector;
use crate::domain::SyncNotice;
use crate::error::{SyncError, SyncResult};
use crate::import::FullStateImportHandler;
use crate::lock::LockName;
use crate::migration::SchemaMigrator;
use crate::resolver::ConflictResolver;
use oplog_model::Operation;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What processing a batch did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    /// Operations not seen before.
    pub received: usize,
    pub applied: usize,
    pub conflicts: usize,
    pub local_win_ops_created: usize,
    /// Discarded because a full-state import supersedes them.
    pub invalidated: usize,
    pub dropped_by_migration: usize,
    /// Already reflected locally (stale or duplicate).
    pub already_known: usize,
}

pub struct RemoteOpsProcessor {
    ctx: SyncContext,
    migrator: Arc<SchemaMigrator>,
    applier: OperationApplier,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    imports: FullStateImportHandler,
}

impl RemoteOpsProcessor {
    pub fn new(ctx: SyncContext, migrator: Arc<SchemaMigrator>) -> Self {
        let applier = OperationApplier::new(ctx.clone());
        Self {
            detector: ConflictDetector::new(ctx.clone()),
            resolver: ConflictResolver::new(ctx.clone(), applier.clone()),
            imports: FullStateImportHandler::new(ctx.clone(), applier.clone()),
            applier,
            migrator,
            ctx,
        }
    }

    pub fn imports(&self) -> &FullStateImportHandler {
        &self.imports
    }

    /// Runs a downloaded batch through the pipeline.
    ///
    /// A batch containing an operation from a too-new schema is refused
    /// whole. Conflict detection, resolution and application run under the
    /// operation-log lock.
    pub async fn process_remote_ops(&self, ops: Vec<Operation>) -> SyncResult<ProcessOutcome> {
        let mut outcome = ProcessOutcome::default();
        let fresh = self.ctx.store.filter_new_ops(&ops).await?;
        if fresh.len() < ops.len() {
            debug!("skipping {} already stored operations", ops.len() - fresh.len());
        }
        outcome.received = fresh.len();
        if fresh.is_empty() {
            return Ok(outcome);
        }

        let migrated = match self.migrator.migrate_batch(fresh) {
            Ok(migrated) => migrated,
            Err(e) => {
                if let SyncError::SchemaTooNew {
                    version,
                    max_supported,
                    ..
                } = &e
                {
                    warn!("refusing batch: schema v{version} is newer than supported v{max_supported}");
                    self.ctx.notifier.notify(SyncNotice::VersionTooNew {
                        version: *version,
                        max_supported: *max_supported,
                    });
                }
                return Err(e);
            }
        };
        if let Some(version) = migrated.newer_version_seen {
            self.ctx
                .notifier
                .notify(SyncNotice::NewerVersionAvailable { version });
        }
        warn_about_dropped_dependencies(&migrated.ops, &migrated.dropped_entity_ids);
        outcome.dropped_by_migration = migrated.dropped_op_ids.len();
        if migrated.ops.is_empty() {
            info!("every remote operation was dropped during migration");
            return Ok(outcome);
        }

        let filtered = self.imports.filter_invalidated(migrated.ops).await?;
        outcome.invalidated = filtered.invalidated.len();
        if filtered.valid.is_empty() {
            return Ok(outcome);
        }

        let _lock = self.ctx.locks.acquire(LockName::OperationLog).await;

        if let (true, Some(import)) = (filtered.import_in_batch, filtered.latest_import.as_ref()) {
            info!("full-state operation in batch, skipping conflict detection");
            let imported = self.imports.apply_import_batch(filtered.valid, import).await?;
            outcome.applied = imported.applied;
            return Ok(outcome);
        }

        let frontier = self.ctx.clocks.entity_frontier().await?;
        let detection = self.detector.detect(&filtered.valid, frontier).await?;
        outcome.already_known = detection.stale.len() + detection.duplicates.len();
        outcome.conflicts = detection.conflicts.len();

        if !detection.conflicts.is_empty() {
            warn!("{} conflicts detected", detection.conflicts.len());
            let resolved = match self.ctx.config.conflict_strategy {
                ConflictStrategy::AutoLww => {
                    self.resolver
                        .auto_resolve_conflicts_lww(detection.conflicts, detection.non_conflicting)
                        .await
                }
                ConflictStrategy::Manual => {
                    self.resolver
                        .present_conflicts(detection.conflicts, detection.non_conflicting)
                        .await
                }
            };
            let resolved = match resolved {
                Ok(resolved) => resolved,
                Err(e) => {
                    if !matches!(e, SyncError::Cancelled) {
                        self.ctx.notifier.notify(SyncNotice::ConflictResolutionFailed {
                            reason: e.to_string(),
                        });
                    }
                    return Err(e);
                }
            };
            outcome.applied = resolved.applied;
            outcome.local_win_ops_created = resolved.local_win_ops_created;
            return Ok(outcome);
        }

        let opts = ApplyOptions {
            is_local_hydration: false,
            latest_import_op_id: filtered.latest_import.as_ref().map(|op| op.id),
        };
        let applied = self
            .applier
            .store_and_apply(detection.non_conflicting, opts)
            .await?;
        outcome.applied = applied.len();
        if outcome.applied > 0 {
            self.ctx.checkpoint("remote operations").await;
        }
        Ok(outcome)
    }
}
