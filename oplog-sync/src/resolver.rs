//! Conflict resolution.
//!
//! Automatic resolution is last-writer-wins per entity: the remote side wins
//! when its latest timestamp is at least the local one. A local win is
//! re-published as a new operation whose clock dominates every clock in the
//! conflict, so other replicas take it as a plain update.

use crate::applier::{ApplyOptions, OperationApplier};
use crate::context::SyncContext;
use crate::domain::REPLACE_FLAG;
use crate::error::{SyncError, SyncResult};
use oplog_clock::VectorClock;
use oplog_model::{
    EntityConflict, OpSource, OpType, Operation, Resolution, SuggestedResolution,
};
use oplog_types::{EntityKey, OpId, HOUR_MS};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Advisory hint for a conflict.
///
/// A side with no operations loses. A timestamp gap over an hour favors the
/// newer side. A local delete defers to remote; a remote-only delete defers
/// to local. A create on exactly one side wins. Anything else is manual.
#[must_use]
pub fn suggest_resolution(local: &[Operation], remote: &[Operation]) -> SuggestedResolution {
    if local.is_empty() {
        return SuggestedResolution::Remote;
    }
    if remote.is_empty() {
        return SuggestedResolution::Local;
    }

    let latest = |ops: &[Operation]| ops.iter().map(|op| op.timestamp).max().unwrap_or(i64::MIN);
    let (local_ts, remote_ts) = (latest(local), latest(remote));
    if local_ts.abs_diff(remote_ts) > HOUR_MS.unsigned_abs() {
        return if local_ts > remote_ts {
            SuggestedResolution::Local
        } else {
            SuggestedResolution::Remote
        };
    }

    let has = |ops: &[Operation], ty: OpType| ops.iter().any(|op| op.op_type == ty);
    match (has(local, OpType::Delete), has(remote, OpType::Delete)) {
        (true, _) => return SuggestedResolution::Remote,
        (false, true) => return SuggestedResolution::Local,
        (false, false) => {}
    }
    match (has(local, OpType::Create), has(remote, OpType::Create)) {
        (true, false) => SuggestedResolution::Local,
        (false, true) => SuggestedResolution::Remote,
        _ => SuggestedResolution::Manual,
    }
}

/// Which side last-writer-wins keeps. Ties go to the remote side.
#[must_use]
pub fn lww_winner(conflict: &EntityConflict) -> Resolution {
    if conflict.remote_timestamp() >= conflict.local_timestamp() {
        Resolution::Remote
    } else {
        Resolution::Local
    }
}

/// What a resolution pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolutionOutcome {
    pub remote_wins: usize,
    pub local_wins: usize,
    /// New local operations created to re-publish local winners.
    pub local_win_ops_created: usize,
    /// Remote operations applied, conflict winners and non-conflicting.
    pub applied: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Local winners are re-published as new operations.
    Lww,
    /// Local winners keep their original operations.
    Manual,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Lww => "lww",
            Mode::Manual => "manual",
        })
    }
}

pub struct ConflictResolver {
    ctx: SyncContext,
    applier: OperationApplier,
}

impl ConflictResolver {
    pub fn new(ctx: SyncContext, applier: OperationApplier) -> Self {
        Self { ctx, applier }
    }

    /// Resolves every conflict by last-writer-wins and applies the rest of
    /// the batch. Callers hold the operation-log lock.
    pub async fn auto_resolve_conflicts_lww(
        &self,
        conflicts: Vec<EntityConflict>,
        non_conflicting: Vec<Operation>,
    ) -> SyncResult<ResolutionOutcome> {
        let decisions: HashMap<EntityKey, Resolution> =
            conflicts.iter().map(|c| (c.key(), lww_winner(c))).collect();
        self.resolve(conflicts, non_conflicting, &decisions, Mode::Lww).await
    }

    /// Asks the user how to settle conflicts, then applies the choices.
    /// Local winners keep their original operations.
    ///
    /// Cancelling returns [`SyncError::Cancelled`] so the batch is retried on
    /// the next sync. Conflicts the user left undecided take the suggested
    /// side, remote when the suggestion is manual.
    pub async fn present_conflicts(
        &self,
        conflicts: Vec<EntityConflict>,
        non_conflicting: Vec<Operation>,
    ) -> SyncResult<ResolutionOutcome> {
        let Some(mut decisions) = self.ctx.prompt.resolve_conflicts(&conflicts).await else {
            info!("user cancelled resolution of {} conflicts", conflicts.len());
            return Err(SyncError::Cancelled);
        };
        for conflict in &conflicts {
            decisions.entry(conflict.key()).or_insert(match conflict.suggested_resolution {
                SuggestedResolution::Local => Resolution::Local,
                SuggestedResolution::Remote | SuggestedResolution::Manual => Resolution::Remote,
            });
        }
        self.resolve(conflicts, non_conflicting, &decisions, Mode::Manual).await
    }

    async fn resolve(
        &self,
        conflicts: Vec<EntityConflict>,
        non_conflicting: Vec<Operation>,
        decisions: &HashMap<EntityKey, Resolution>,
        mode: Mode,
    ) -> SyncResult<ResolutionOutcome> {
        if let Err(e) = self.ctx.backup.backup("before conflict resolution").await {
            warn!("backup before conflict resolution failed, continuing: {e}");
        }

        let mut outcome = ResolutionOutcome::default();
        let pending_by_entity = self.ctx.store.get_unsynced_by_entity().await?;

        let mut clock = self.ctx.clocks.current_clock().await?;
        for conflict in &conflicts {
            for op in conflict.local_ops.iter().chain(&conflict.remote_ops) {
                clock.merge(&op.vector_clock);
            }
        }

        let mut reject: Vec<OpId> = Vec::new();
        let mut rejected_remote: Vec<Operation> = Vec::new();
        let mut local_wins: Vec<Operation> = Vec::new();
        let mut to_apply: Vec<Operation> = Vec::new();
        let mut queued: HashSet<OpId> = HashSet::new();

        for conflict in conflicts {
            let key = conflict.key();
            let winner = decisions.get(&key).copied().unwrap_or(Resolution::Remote);
            let pending_ids = pending_by_entity
                .get(&key)
                .into_iter()
                .flatten()
                .map(|e| e.op.id);
            let local_ids = conflict.local_ops.iter().map(|op| op.id);

            match winner {
                Resolution::Remote => {
                    debug!("{mode}: remote wins {key}");
                    outcome.remote_wins += 1;
                    reject.extend(local_ids.chain(pending_ids));
                    for op in conflict.remote_ops {
                        if queued.insert(op.id) {
                            to_apply.push(op);
                        }
                    }
                }
                Resolution::Local => {
                    debug!("{mode}: local wins {key}");
                    outcome.local_wins += 1;
                    if mode == Mode::Lww {
                        reject.extend(local_ids.chain(pending_ids));
                        clock.increment(&self.ctx.client_id);
                        let op = self
                            .local_win_op(&key, conflict.local_timestamp(), clock.clone(), &conflict)
                            .await?;
                        local_wins.push(op);
                    }
                    rejected_remote.extend(conflict.remote_ops);
                }
            }
        }

        // A remote op that also won on another entity still gets applied.
        rejected_remote.retain(|op| !queued.contains(&op.id));
        for op in non_conflicting {
            if queued.insert(op.id) {
                to_apply.push(op);
            }
        }

        reject.sort();
        reject.dedup();
        self.ctx.store.mark_rejected(&reject).await?;
        for op in &rejected_remote {
            self.ctx.store.append(op, OpSource::Remote, true).await?;
        }
        self.ctx
            .store
            .mark_rejected(&rejected_remote.iter().map(|op| op.id).collect::<Vec<_>>())
            .await?;

        for op in &local_wins {
            self.ctx.store.append(op, OpSource::Local, false).await?;
        }
        if !local_wins.is_empty() {
            self.ctx.store.save_vector_clock(&clock).await?;
        }
        outcome.local_win_ops_created = local_wins.len();

        let applied = self
            .applier
            .store_and_apply(to_apply, ApplyOptions::default())
            .await?;
        outcome.applied = applied.len();

        self.ctx.checkpoint("conflict resolution").await;
        info!(
            "{mode} resolution: {} remote wins, {} local wins, {} ops applied",
            outcome.remote_wins, outcome.local_wins, outcome.applied
        );
        Ok(outcome)
    }

    /// Builds the operation that re-publishes a local winner: an update
    /// carrying the current entity, or a delete when it no longer exists.
    async fn local_win_op(
        &self,
        key: &EntityKey,
        timestamp: i64,
        clock: VectorClock,
        conflict: &EntityConflict,
    ) -> SyncResult<Operation> {
        let (op_type, payload) = match self.ctx.domain.entity_state(key).await? {
            Some(state) => (OpType::Update, json!({ "changes": state, REPLACE_FLAG: true })),
            None => {
                if !conflict.local_ops.iter().any(|op| op.op_type == OpType::Delete) {
                    warn!("local winner {key} is missing locally, publishing a delete");
                }
                (OpType::Delete, serde_json::Value::Null)
            }
        };
        let op = Operation::new(
            self.ctx.client_id.clone(),
            op_type,
            key.entity_type,
            key.entity_id.clone(),
            payload,
            clock,
        )
        .with_timestamp(timestamp)
        .with_schema_version(self.ctx.config.current_schema_version);
        op.validate()?;
        Ok(op)
    }
}
