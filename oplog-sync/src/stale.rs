//! Re-publishing local operations the server refused as concurrent.
//!
//! When a pending local operation is rejected for concurrent modification
//! and downloading did not settle it, its clock is stale: it misses entries
//! the server has seen. The operation is replaced by a fresh one whose clock
//! dominates everything known, carrying the entity's current state.

use crate::context::SyncContext;
use crate::domain::REPLACE_FLAG;
use crate::error::SyncResult;
use crate::lock::LockName;
use oplog_clock::VectorClock;
use oplog_model::{OpSource, OpType, Operation};
use oplog_types::{EntityKey, OpId};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct StaleOperationResolver {
    ctx: SyncContext,
}

impl StaleOperationResolver {
    pub fn new(ctx: SyncContext) -> Self {
        Self { ctx }
    }

    /// Rejects `stale` local operations and appends one replacement per
    /// entity. Returns the number of replacement operations created.
    ///
    /// The replacement clock is the global clock merged with the stale
    /// clocks, `extra_clocks` and `snapshot_clock`, incremented once per
    /// replacement. Entities that still exist get an update with their
    /// current state; entities that are gone get a delete when one of the
    /// stale ops was a delete, and nothing otherwise.
    pub async fn resolve_stale_local_ops(
        &self,
        stale: &[Operation],
        extra_clocks: &[VectorClock],
        snapshot_clock: Option<&VectorClock>,
    ) -> SyncResult<usize> {
        if stale.is_empty() {
            return Ok(0);
        }
        let _lock = self.ctx.locks.acquire(LockName::OperationLog).await;

        let mut by_entity: BTreeMap<EntityKey, Vec<&Operation>> = BTreeMap::new();
        for op in stale {
            for key in op.entity_keys() {
                by_entity.entry(key).or_default().push(op);
            }
        }

        let mut clock = self.ctx.clocks.current_clock().await?;
        for c in stale
            .iter()
            .map(|op| &op.vector_clock)
            .chain(extra_clocks)
            .chain(snapshot_clock)
        {
            clock.merge(c);
        }

        let mut replacements = Vec::new();
        for (key, ops) in &by_entity {
            let timestamp = ops.iter().map(|op| op.timestamp).max().unwrap_or_default();
            let (op_type, payload) = match self.ctx.domain.entity_state(key).await? {
                Some(state) => (OpType::Update, json!({ "changes": state, REPLACE_FLAG: true })),
                None if ops.iter().any(|op| op.op_type == OpType::Delete) => {
                    (OpType::Delete, serde_json::Value::Null)
                }
                None => {
                    debug!("{key} vanished without a delete, dropping its stale ops");
                    continue;
                }
            };
            clock.increment(&self.ctx.client_id);
            let op = Operation::new(
                self.ctx.client_id.clone(),
                op_type,
                key.entity_type,
                key.entity_id.clone(),
                payload,
                clock.clone(),
            )
            .with_timestamp(timestamp)
            .with_schema_version(self.ctx.config.current_schema_version);
            op.validate()?;
            replacements.push(op);
        }

        let stale_ids: Vec<OpId> = stale.iter().map(|op| op.id).collect();
        self.ctx.store.mark_rejected(&stale_ids).await?;
        for op in &replacements {
            self.ctx.store.append(op, OpSource::Local, false).await?;
        }
        self.ctx.store.save_vector_clock(&clock).await?;

        info!(
            "replaced {} stale local operations with {} new ones",
            stale_ids.len(),
            replacements.len()
        );
        Ok(replacements.len())
    }
}
