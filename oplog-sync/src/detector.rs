//! Conflict detection.
//!
//! Each remote operation is compared, per entity it touches, against that
//! entity's local frontier: the snapshot baseline (only when the snapshot
//! recorded the entity), the applied frontier, and the clocks of pending
//! local operations.

use crate::context::SyncContext;
use crate::error::SyncResult;
use crate::resolver::suggest_resolution;
use oplog_clock::{CausalOrder, VectorClock};
use oplog_model::{EntityConflict, Operation, OperationLogEntry};
use oplog_types::{EntityKey, OpId};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// How one remote operation relates to one entity's local frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Newer than everything local; apply.
    Apply,
    /// Local state already dominates it.
    Stale,
    /// Local state already contains exactly this history.
    Duplicate,
    /// Concurrent with pending local changes.
    Conflict,
}

/// Everything detection reads, captured once per batch.
#[derive(Debug, Default, Clone)]
pub struct DetectionInput {
    pub snapshot_clock: VectorClock,
    /// `None` for no snapshot or a legacy snapshot without keys.
    pub snapshot_entity_keys: Option<BTreeSet<EntityKey>>,
    pub applied_frontier: HashMap<EntityKey, VectorClock>,
    /// Applied frontier without local entries still awaiting upload.
    pub settled_frontier: HashMap<EntityKey, VectorClock>,
    pub pending_by_entity: HashMap<EntityKey, Vec<OperationLogEntry>>,
}

impl DetectionInput {
    fn snapshot_applies_to(&self, key: &EntityKey) -> bool {
        match &self.snapshot_entity_keys {
            Some(keys) => keys.contains(key),
            None => true,
        }
    }

    /// Snapshot (when it covers the entity) merged with the applied frontier.
    #[must_use]
    pub fn baseline(&self, key: &EntityKey) -> VectorClock {
        let mut baseline = if self.snapshot_applies_to(key) {
            self.snapshot_clock.clone()
        } else {
            VectorClock::new()
        };
        if let Some(applied) = self.applied_frontier.get(key) {
            baseline.merge(applied);
        }
        baseline
    }

    /// Classifies `op` against the entity `key`.
    #[must_use]
    pub fn classify(&self, op: &Operation, key: &EntityKey) -> Classification {
        let pending: Vec<&OperationLogEntry> = self
            .pending_by_entity
            .get(key)
            .map(|entries| entries.iter().filter(|e| e.op.id != op.id).collect())
            .unwrap_or_default();
        let baseline = self.baseline(key);

        if pending.is_empty() {
            if baseline.is_empty() {
                return Classification::Apply;
            }
            return match baseline.compare(&op.vector_clock) {
                CausalOrder::After => Classification::Stale,
                CausalOrder::Equal => Classification::Duplicate,
                CausalOrder::Before | CausalOrder::Concurrent => Classification::Apply,
            };
        }

        let mut frontier = baseline.clone();
        for entry in &pending {
            frontier.merge(&entry.op.vector_clock);
        }

        match frontier.compare(&op.vector_clock) {
            CausalOrder::After => Classification::Stale,
            CausalOrder::Equal => Classification::Duplicate,
            CausalOrder::Concurrent => Classification::Conflict,
            CausalOrder::Before => {
                let settled_empty = self.settled_frontier.get(key).is_none_or(VectorClock::is_empty);
                if self.snapshot_clock.is_empty() && settled_empty {
                    warn!(
                        "entity {key} has pending local ops but no snapshot or settled history; \
                         treating remote op {} as concurrent",
                        op.id
                    );
                    Classification::Conflict
                } else {
                    Classification::Apply
                }
            }
        }
    }
}

/// Result of [`ConflictDetector::detect`].
#[derive(Debug, Default, Clone)]
pub struct DetectionResult {
    pub non_conflicting: Vec<Operation>,
    pub conflicts: Vec<EntityConflict>,
    pub stale: Vec<OpId>,
    pub duplicates: Vec<OpId>,
}

/// Classifies a batch against prepared inputs.
///
/// An op that conflicts on any entity joins that entity's conflict; an op
/// that applies on any other entity is non-conflicting; otherwise it is a
/// duplicate or stale. Conflicts on one entity within the batch merge.
#[must_use]
pub fn detect_with(remote_ops: &[Operation], input: &DetectionInput) -> DetectionResult {
    let mut result = DetectionResult::default();
    let mut conflict_index: HashMap<EntityKey, usize> = HashMap::new();

    for op in remote_ops {
        let keys = op.entity_keys();
        if keys.is_empty() {
            result.non_conflicting.push(op.clone());
            continue;
        }

        let verdicts: Vec<(EntityKey, Classification)> = keys
            .into_iter()
            .map(|key| {
                let verdict = input.classify(op, &key);
                (key, verdict)
            })
            .collect();

        let conflicting: Vec<&EntityKey> = verdicts
            .iter()
            .filter(|(_, v)| *v == Classification::Conflict)
            .map(|(k, _)| k)
            .collect();

        if !conflicting.is_empty() {
            for key in conflicting {
                let idx = *conflict_index.entry(key.clone()).or_insert_with(|| {
                    let local_ops = input
                        .pending_by_entity
                        .get(key)
                        .map(|entries| entries.iter().map(|e| e.op.clone()).collect())
                        .unwrap_or_default();
                    result.conflicts.push(EntityConflict {
                        entity_type: key.entity_type,
                        entity_id: key.entity_id.clone(),
                        local_ops,
                        remote_ops: Vec::new(),
                        suggested_resolution: oplog_model::SuggestedResolution::Manual,
                    });
                    result.conflicts.len() - 1
                });
                result.conflicts[idx].remote_ops.push(op.clone());
            }
            continue;
        }

        if verdicts.iter().any(|(_, v)| *v == Classification::Apply) {
            result.non_conflicting.push(op.clone());
        } else if verdicts.iter().any(|(_, v)| *v == Classification::Duplicate) {
            debug!("dropping duplicate remote op {}", op.id);
            result.duplicates.push(op.id);
        } else {
            debug!("dropping stale remote op {}", op.id);
            result.stale.push(op.id);
        }
    }

    for conflict in &mut result.conflicts {
        conflict.suggested_resolution = suggest_resolution(&conflict.local_ops, &conflict.remote_ops);
    }
    result
}

pub struct ConflictDetector {
    ctx: SyncContext,
}

impl ConflictDetector {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Classifies `remote_ops` against the applied frontier, the snapshot
    /// and pending local operations. Callers hold the operation-log lock
    /// from reading `applied_frontier` until the result has been acted on.
    pub async fn detect(
        &self,
        remote_ops: &[Operation],
        applied_frontier: HashMap<EntityKey, VectorClock>,
    ) -> SyncResult<DetectionResult> {
        let snapshot = self.ctx.store.load_snapshot().await?;
        let input = DetectionInput {
            snapshot_clock: snapshot.as_ref().map(|s| s.vector_clock.clone()).unwrap_or_default(),
            snapshot_entity_keys: snapshot.and_then(|s| s.entity_keys),
            applied_frontier,
            settled_frontier: self.ctx.clocks.settled_frontier().await?,
            pending_by_entity: self.ctx.store.get_unsynced_by_entity().await?,
        };
        let result = detect_with(remote_ops, &input);
        debug!(
            "detected {} non-conflicting, {} conflicts, {} stale, {} duplicate",
            result.non_conflicting.len(),
            result.conflicts.len(),
            result.stale.len(),
            result.duplicates.len()
        );
        Ok(result)
    }
}
