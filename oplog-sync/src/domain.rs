//! Collaborators the engine drives but does not own.
//!
//! - [`DomainState`]: applies operations and answers state queries
//! - [`StateValidator`]: the validation checkpoint run after every batch
//! - [`BackupService`]: best-effort backup before conflict resolution
//! - [`UserPrompt`]: manual conflict resolution and fresh-client confirmation
//! - [`SyncNotifier`]: user-visible notices
//!
//! [`MemoryDomainState`] is a reference domain that stores every entity as a
//! JSON object keyed by `TYPE` then id.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use oplog_model::{EntityConflict, OpType, Operation, Resolution, SuggestedResolution};
use oplog_types::{EntityKey, EntityType, OpId};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// The materialized document graph.
///
/// `apply_operation` must be idempotent: crash recovery may re-apply an
/// operation whose effect already landed.
#[async_trait]
pub trait DomainState: Send + Sync {
    async fn apply_operation(&self, op: &Operation) -> SyncResult<()>;

    /// Current state of one entity, `None` when it does not exist.
    async fn entity_state(&self, key: &EntityKey) -> SyncResult<Option<Value>>;

    async fn entity_exists(&self, key: &EntityKey) -> SyncResult<bool> {
        Ok(self.entity_state(key).await?.is_some())
    }

    /// The whole state, in the shape full-state operations carry.
    async fn full_state(&self) -> SyncResult<Value>;

    async fn entity_keys(&self) -> SyncResult<BTreeSet<EntityKey>>;

    /// Replaces the whole state.
    async fn restore_state(&self, state: &Value) -> SyncResult<()>;
}

/// Validation checkpoint run at the end of every resolution path.
#[async_trait]
pub trait StateValidator: Send + Sync {
    /// Validates state and repairs it if needed. Returns whether the state
    /// was valid (or repaired).
    async fn validate_and_repair(&self, context: &str) -> SyncResult<bool>;
}

/// Takes a state backup before conflict resolution.
#[async_trait]
pub trait BackupService: Send + Sync {
    async fn backup(&self, reason: &str) -> SyncResult<()>;
}

/// Human-facing decisions.
#[async_trait]
pub trait UserPrompt: Send + Sync {
    /// Asks how to settle conflicts. `None` cancels resolution entirely.
    async fn resolve_conflicts(
        &self,
        conflicts: &[EntityConflict],
    ) -> Option<HashMap<EntityKey, Resolution>>;

    /// Asks a client with no local history whether to download `op_count`
    /// remote operations.
    async fn confirm_fresh_client_download(&self, op_count: usize) -> bool;
}

/// User-visible notices emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    /// A batch stopped at a failing operation; the rest were marked failed.
    PartialApplyFailure {
        applied: usize,
        failed_op: OpId,
        reason: String,
    },
    /// A remote operation needs a newer build. Nothing from the batch was
    /// applied.
    VersionTooNew { version: u32, max_supported: u32 },
    /// Operations from a newer, still compatible build were seen.
    NewerVersionAvailable { version: u32 },
    /// The server permanently rejected operations.
    OpsRejected { count: usize },
    /// Own operations could not be replayed after an import.
    ReplayFailed { reason: String },
    /// Conflict resolution failed; the batch will be retried.
    ConflictResolutionFailed { reason: String },
    /// The server is out of storage for this account.
    StorageQuotaExceeded,
    /// A hard dependency was missing; a full re-sync is required.
    StateCorrupted { reason: String },
}

pub trait SyncNotifier: Send + Sync {
    fn notify(&self, notice: SyncNotice);
}

// ── Default collaborators ────────────────────────────────────────

/// Validator that accepts every state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

#[async_trait]
impl StateValidator for NoopValidator {
    async fn validate_and_repair(&self, context: &str) -> SyncResult<bool> {
        debug!("validation checkpoint: {context}");
        Ok(true)
    }
}

/// Backup service that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBackup;

#[async_trait]
impl BackupService for NoopBackup {
    async fn backup(&self, reason: &str) -> SyncResult<()> {
        debug!("skipping backup ({reason})");
        Ok(())
    }
}

/// Prompt that takes the suggested side (remote when the hint is manual)
/// and accepts fresh-client downloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoPrompt;

#[async_trait]
impl UserPrompt for AutoPrompt {
    async fn resolve_conflicts(
        &self,
        conflicts: &[EntityConflict],
    ) -> Option<HashMap<EntityKey, Resolution>> {
        Some(
            conflicts
                .iter()
                .map(|c| {
                    let side = match c.suggested_resolution {
                        SuggestedResolution::Local => Resolution::Local,
                        SuggestedResolution::Remote | SuggestedResolution::Manual => {
                            Resolution::Remote
                        }
                    };
                    (c.key(), side)
                })
                .collect(),
        )
    }

    async fn confirm_fresh_client_download(&self, _op_count: usize) -> bool {
        true
    }
}

/// Notifier that writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl SyncNotifier for TracingNotifier {
    fn notify(&self, notice: SyncNotice) {
        match &notice {
            SyncNotice::NewerVersionAvailable { .. } => info!("sync notice: {notice:?}"),
            SyncNotice::StateCorrupted { .. } | SyncNotice::ReplayFailed { .. } => {
                error!("sync notice: {notice:?}")
            }
            _ => warn!("sync notice: {notice:?}"),
        }
    }
}

/// Notifier that keeps every notice, for hosts that poll.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<SyncNotice>>,
}

impl RecordingNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices received so far.
    pub fn notices(&self) -> Vec<SyncNotice> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Removes and returns the notices received so far.
    pub fn take(&self) -> Vec<SyncNotice> {
        std::mem::take(&mut *self.notices.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl SyncNotifier for RecordingNotifier {
    fn notify(&self, notice: SyncNotice) {
        TracingNotifier.notify(notice.clone());
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notice);
    }
}

// ── MemoryDomainState ────────────────────────────────────────────

/// Reference domain state.
///
/// Creates insert the payload, updates and moves shallow-merge the payload
/// (or its `changes` object) into an existing entity, deletes remove the
/// entity. An update flagged with [`REPLACE_FLAG`] recreates a missing
/// entity. Batch payloads map entity ids to changes, `null` deleting. Full
/// state is `{ "TASK": { "t1": {...} }, ... }`.
#[derive(Debug, Default)]
pub struct MemoryDomainState {
    entities: RwLock<BTreeMap<EntityKey, Value>>,
}

impl MemoryDomainState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }
}

/// Payload flag marking an update that carries the entire entity.
pub const REPLACE_FLAG: &str = "replace";

fn changes_of(payload: &Value) -> &Value {
    payload.get("changes").unwrap_or(payload)
}

/// Conflict-resolution updates carry the whole entity and recreate it when
/// a concurrent delete removed it.
fn is_replacement(payload: &Value) -> bool {
    payload.get(REPLACE_FLAG).and_then(Value::as_bool).unwrap_or(false)
}

fn merge_into(target: &mut Value, changes: &Value) {
    match (target.as_object_mut(), changes.as_object()) {
        (Some(existing), Some(changes)) => {
            for (k, v) in changes {
                existing.insert(k.clone(), v.clone());
            }
        }
        _ => *target = changes.clone(),
    }
}

fn state_from_value(state: &Value) -> SyncResult<BTreeMap<EntityKey, Value>> {
    let mut entities = BTreeMap::new();
    let Some(types) = state.as_object() else {
        return Err(SyncError::apply("full-state", "state must be a JSON object"));
    };
    for (ty, by_id) in types {
        let entity_type: EntityType = ty
            .parse()
            .map_err(|e: oplog_types::Error| SyncError::apply("full-state", e.to_string()))?;
        let Some(by_id) = by_id.as_object() else {
            return Err(SyncError::apply("full-state", format!("{ty} must map ids to entities")));
        };
        for (id, value) in by_id {
            entities.insert(EntityKey::new(entity_type, id.as_str()), value.clone());
        }
    }
    Ok(entities)
}

#[async_trait]
impl DomainState for MemoryDomainState {
    async fn apply_operation(&self, op: &Operation) -> SyncResult<()> {
        if op.is_full_state() {
            return self.restore_state(&op.payload).await;
        }
        let mut entities = self.entities.write().await;
        match op.op_type {
            OpType::Create => {
                for key in op.entity_keys() {
                    entities.insert(key, changes_of(&op.payload).clone());
                }
            }
            OpType::Update | OpType::Move => {
                for key in op.entity_keys() {
                    if let Some(existing) = entities.get_mut(&key) {
                        merge_into(existing, changes_of(&op.payload));
                    } else if is_replacement(&op.payload) {
                        entities.insert(key, changes_of(&op.payload).clone());
                    } else {
                        debug!("{:?} for missing entity {key} ignored", op.op_type);
                    }
                }
            }
            OpType::Delete => {
                for key in op.entity_keys() {
                    entities.remove(&key);
                }
            }
            OpType::Batch => {
                let per_entity = op.payload.as_object().cloned().unwrap_or_default();
                for key in op.entity_keys() {
                    match per_entity.get(key.entity_id.as_str()) {
                        Some(Value::Null) => {
                            entities.remove(&key);
                        }
                        Some(changes) => {
                            let entry = entities
                                .entry(key)
                                .or_insert_with(|| Value::Object(Map::new()));
                            merge_into(entry, changes);
                        }
                        None => {}
                    }
                }
            }
            OpType::SyncImport | OpType::BackupImport | OpType::Repair => {}
        }
        Ok(())
    }

    async fn entity_state(&self, key: &EntityKey) -> SyncResult<Option<Value>> {
        Ok(self.entities.read().await.get(key).cloned())
    }

    async fn full_state(&self) -> SyncResult<Value> {
        let entities = self.entities.read().await;
        let mut state = Map::new();
        for (key, value) in entities.iter() {
            let by_id = state
                .entry(key.entity_type.as_str())
                .or_insert_with(|| Value::Object(Map::new()));
            if let Some(by_id) = by_id.as_object_mut() {
                by_id.insert(key.entity_id.to_string(), value.clone());
            }
        }
        Ok(Value::Object(state))
    }

    async fn entity_keys(&self) -> SyncResult<BTreeSet<EntityKey>> {
        Ok(self.entities.read().await.keys().cloned().collect())
    }

    async fn restore_state(&self, state: &Value) -> SyncResult<()> {
        let restored = state_from_value(state)?;
        *self.entities.write().await = restored;
        Ok(())
    }
}
