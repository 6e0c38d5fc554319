//! Engine configuration.

use crate::error::SyncResult;
use serde::{Deserialize, Serialize};

/// How detected conflicts are settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Last-writer-wins, no user involvement.
    #[default]
    AutoLww,
    /// Ask the [`UserPrompt`](crate::UserPrompt) collaborator.
    Manual,
}

/// Configuration for the sync engine.
///
/// Every field has a default, so a partial JSON document is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Schema version this build writes.
    pub current_schema_version: u32,
    /// Oldest schema version that can still be migrated.
    pub min_supported_schema_version: u32,
    /// How far ahead of `current_schema_version` a remote op may be.
    pub max_version_skip: u32,
    /// Operations per download page.
    pub download_page_size: usize,
    /// Operations per upload request.
    pub upload_batch_size: usize,
    /// Local operations between automatic compactions.
    pub compaction_threshold: u64,
    /// Settled entries younger than this survive compaction (ms).
    pub compaction_retention_ms: i64,
    /// Retention used by emergency compaction (ms).
    pub emergency_retention_ms: i64,
    /// Permanent rejections in one upload before the user is notified.
    pub max_rejected_ops_before_warning: usize,
    /// Failed applies before an entry is given up on.
    pub max_conflict_retry_attempts: u32,
    /// Upload/download rounds allowed in one sync cycle.
    pub max_sync_rounds: u32,
    /// Optional wall-clock budget for one sync cycle (ms).
    pub sync_timeout_ms: Option<u64>,
    pub conflict_strategy: ConflictStrategy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            current_schema_version: 1,
            min_supported_schema_version: 1,
            max_version_skip: 5,
            download_page_size: 500,
            upload_batch_size: 100,
            compaction_threshold: 500,
            compaction_retention_ms: 5 * 60 * 1000,
            emergency_retention_ms: 60 * 1000,
            max_rejected_ops_before_warning: 10,
            max_conflict_retry_attempts: 5,
            max_sync_rounds: 10,
            sync_timeout_ms: None,
            conflict_strategy: ConflictStrategy::AutoLww,
        }
    }
}

impl SyncConfig {
    /// Parses a configuration document. Missing fields keep their defaults.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Newest schema version a remote operation may carry.
    #[must_use]
    pub fn max_supported_schema_version(&self) -> u32 {
        self.current_schema_version + self.max_version_skip
    }
}
