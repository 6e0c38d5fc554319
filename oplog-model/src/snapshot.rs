use oplog_clock::VectorClock;
use oplog_types::EntityKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Compacted state plus the causal frontier of every folded operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Merge of the clocks of every operation folded into `state`.
    pub vector_clock: VectorClock,
    /// Entities present when the snapshot was taken. `None` for snapshots
    /// written before keys were recorded.
    #[serde(default)]
    pub entity_keys: Option<BTreeSet<EntityKey>>,
    pub last_applied_seq: u64,
    pub state: serde_json::Value,
    pub compacted_at: i64,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    1
}

impl Snapshot {
    /// Snapshots without recorded entity keys need a re-compaction.
    #[must_use]
    pub fn is_legacy_format(&self) -> bool {
        self.entity_keys.is_none()
    }

    /// Whether the snapshot clock describes `key`.
    ///
    /// Legacy snapshots cannot tell, so they are assumed to cover every key.
    #[must_use]
    pub fn covers(&self, key: &EntityKey) -> bool {
        self.entity_keys.as_ref().is_none_or(|keys| keys.contains(key))
    }
}
