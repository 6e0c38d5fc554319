//! Error types for the sync layer.

use oplog_model::ModelError;
use oplog_store::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Transport failure. Retry the whole cycle later; no local state changed.
    #[error("network error: {0}")]
    Network(String),

    /// The server rejected an upload because of a concurrent modification.
    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    /// The server permanently rejected an operation.
    #[error("operation {op_id} permanently rejected: {reason}")]
    PermanentRejection { op_id: String, reason: String },

    /// A hard dependency was missing at apply time. A full re-sync is needed.
    #[error("state corrupted while applying {op_id}: {reason}")]
    StateCorrupted { op_id: String, reason: String },

    /// A remote operation was written by a build too new to understand.
    #[error("operation {op_id} has schema version {version}, newest supported is {max_supported}")]
    SchemaTooNew {
        op_id: String,
        version: u32,
        max_supported: u32,
    },

    /// A remote operation predates the oldest migratable schema.
    #[error("operation {op_id} has schema version {version}, oldest supported is {min_supported}")]
    SchemaTooOld {
        op_id: String,
        version: u32,
        min_supported: u32,
    },

    /// Replaying own operations after a full-state import failed.
    #[error("replay after import failed: {0}")]
    ReplayFailed(String),

    /// Domain state refused an operation.
    #[error("failed to apply {op_id}: {reason}")]
    Apply { op_id: String, reason: String },

    /// Migration registry or migration step failure.
    #[error("migration error: {0}")]
    Migration(String),

    /// Structurally invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(#[from] ModelError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The user cancelled conflict resolution or a fresh-client download.
    #[error("cancelled by user")]
    Cancelled,

    /// A sync cycle kept producing new work past the round limit.
    #[error("sync did not settle after {rounds} rounds")]
    SyncLoopDetected { rounds: u32 },

    /// The caller's wall-clock budget for a sync cycle ran out.
    #[error("operation timed out")]
    Timeout,
}

impl SyncError {
    /// Whether retrying the whole cycle later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout)
    }

    pub(crate) fn apply(op_id: impl ToString, reason: impl Into<String>) -> Self {
        SyncError::Apply {
            op_id: op_id.to_string(),
            reason: reason.into(),
        }
    }
}
