use crate::ModelError;
use oplog_clock::VectorClock;
use oplog_types::{now_millis, ClientId, EntityId, EntityKey, EntityType, OpId};
use serde::{Deserialize, Serialize};

/// What an operation does to its target(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "CRT")]
    Create,
    #[serde(rename = "UPD")]
    Update,
    #[serde(rename = "DEL")]
    Delete,
    #[serde(rename = "MOV")]
    Move,
    #[serde(rename = "BATCH")]
    Batch,
    #[serde(rename = "SYNC_IMPORT")]
    SyncImport,
    #[serde(rename = "BACKUP_IMPORT")]
    BackupImport,
    #[serde(rename = "REPAIR")]
    Repair,
}

impl OpType {
    /// Full-state operations replace the whole document graph.
    #[must_use]
    pub const fn is_full_state(&self) -> bool {
        matches!(self, OpType::SyncImport | OpType::BackupImport | OpType::Repair)
    }
}

/// Schema version an operation was written with.
///
/// Operations from builds that predate versioning carry no version and are
/// treated as version 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "Option<u32>", into = "Option<u32>")]
pub enum SchemaVersion {
    #[default]
    Legacy,
    V(u32),
}

impl SchemaVersion {
    /// Effective version number.
    #[must_use]
    pub const fn get(&self) -> u32 {
        match self {
            SchemaVersion::Legacy => 1,
            SchemaVersion::V(v) => *v,
        }
    }
}

impl From<Option<u32>> for SchemaVersion {
    fn from(v: Option<u32>) -> Self {
        v.map_or(SchemaVersion::Legacy, SchemaVersion::V)
    }
}

impl From<SchemaVersion> for Option<u32> {
    fn from(v: SchemaVersion) -> Self {
        match v {
            SchemaVersion::Legacy => None,
            SchemaVersion::V(v) => Some(v),
        }
    }
}

/// An immutable change record.
///
/// `vector_clock` is the author's clock at creation and always has an entry
/// of at least 1 for `client_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: OpId,
    pub client_id: ClientId,
    pub op_type: OpType,
    pub entity_type: EntityType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entity_ids: Vec<EntityId>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub vector_clock: VectorClock,
    pub timestamp: i64,
    #[serde(default)]
    pub schema_version: SchemaVersion,
}

impl Operation {
    /// Creates an operation on a single entity, stamped now.
    #[must_use]
    pub fn new(
        client_id: ClientId,
        op_type: OpType,
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        payload: serde_json::Value,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            id: OpId::new(),
            client_id,
            op_type,
            entity_type,
            entity_id: Some(entity_id.into()),
            entity_ids: Vec::new(),
            payload,
            vector_clock,
            timestamp: now_millis(),
            schema_version: SchemaVersion::Legacy,
        }
    }

    /// Creates a full-state operation whose payload is the whole state.
    #[must_use]
    pub fn full_state(
        client_id: ClientId,
        op_type: OpType,
        state: serde_json::Value,
        vector_clock: VectorClock,
    ) -> Self {
        Self {
            id: OpId::new(),
            client_id,
            op_type,
            entity_type: EntityType::All,
            entity_id: None,
            entity_ids: Vec::new(),
            payload: state,
            vector_clock,
            timestamp: now_millis(),
            schema_version: SchemaVersion::Legacy,
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_id(mut self, id: OpId) -> Self {
        self.id = id;
        self
    }

    #[must_use]
    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = SchemaVersion::V(version);
        self
    }

    #[must_use]
    pub fn with_entity_ids(mut self, ids: Vec<EntityId>) -> Self {
        self.entity_ids = ids;
        self
    }

    /// Entity ids touched by this operation. Batch ops list several.
    #[must_use]
    pub fn target_ids(&self) -> Vec<EntityId> {
        if !self.entity_ids.is_empty() {
            return self.entity_ids.clone();
        }
        self.entity_id.iter().cloned().collect()
    }

    /// Entity keys touched by this operation.
    #[must_use]
    pub fn entity_keys(&self) -> Vec<EntityKey> {
        self.target_ids()
            .into_iter()
            .map(|id| EntityKey::new(self.entity_type, id))
            .collect()
    }

    #[must_use]
    pub fn is_full_state(&self) -> bool {
        self.op_type.is_full_state()
    }

    /// Checks the structural invariants of an operation.
    pub fn validate(&self) -> Result<(), ModelError> {
        let fail = |reason: String| ModelError::InvalidOperation {
            op_id: self.id.to_string(),
            reason,
        };
        if self.vector_clock.get(&self.client_id) < 1 {
            return Err(fail(format!(
                "clock {} has no entry for author {}",
                self.vector_clock, self.client_id
            )));
        }
        if !self.is_full_state() && self.target_ids().is_empty() {
            return Err(fail(format!("{:?} operation without a target entity", self.op_type)));
        }
        Ok(())
    }
}

/// A local change before the engine stamps it with an id and a clock.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationDraft {
    pub op_type: OpType,
    pub entity_type: EntityType,
    pub entity_id: Option<EntityId>,
    pub entity_ids: Vec<EntityId>,
    pub payload: serde_json::Value,
}

impl OperationDraft {
    #[must_use]
    pub fn new(
        op_type: OpType,
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            op_type,
            entity_type,
            entity_id: Some(entity_id.into()),
            entity_ids: Vec::new(),
            payload,
        }
    }

    /// Stamps the draft into an operation authored by `client_id`.
    #[must_use]
    pub fn into_operation(
        self,
        client_id: ClientId,
        vector_clock: VectorClock,
        schema_version: u32,
    ) -> Operation {
        Operation {
            id: OpId::new(),
            client_id,
            op_type: self.op_type,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            entity_ids: self.entity_ids,
            payload: self.payload,
            vector_clock,
            timestamp: now_millis(),
            schema_version: SchemaVersion::V(schema_version),
        }
    }
}
