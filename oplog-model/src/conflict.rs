use crate::Operation;
use oplog_types::{EntityId, EntityKey, EntityType};
use serde::{Deserialize, Serialize};

/// Advisory hint attached to every detected conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestedResolution {
    Local,
    Remote,
    Manual,
}

/// Which side a resolved conflict keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Local,
    Remote,
}

/// Concurrent local and remote edits of the same entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityConflict {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub local_ops: Vec<Operation>,
    pub remote_ops: Vec<Operation>,
    pub suggested_resolution: SuggestedResolution,
}

impl EntityConflict {
    #[must_use]
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.entity_type, self.entity_id.clone())
    }

    /// Latest local timestamp, or `i64::MIN` when there are no local ops.
    #[must_use]
    pub fn local_timestamp(&self) -> i64 {
        self.local_ops.iter().map(|op| op.timestamp).max().unwrap_or(i64::MIN)
    }

    /// Latest remote timestamp, or `i64::MIN` when there are no remote ops.
    #[must_use]
    pub fn remote_timestamp(&self) -> i64 {
        self.remote_ops.iter().map(|op| op.timestamp).max().unwrap_or(i64::MIN)
    }
}
