//! Data model of the operation log.
//!
//! - [`Operation`]: the immutable unit of change and causality
//! - [`OperationLogEntry`]: an operation plus its local bookkeeping
//! - [`Snapshot`]: compacted state with its causal frontier
//! - [`EntityConflict`]: concurrent local and remote edits of one entity
//!
//! These types are shared by the store and the sync engine, and travel to
//! the sync server as camelCase JSON.

mod conflict;
mod log_entry;
mod operation;
mod snapshot;

pub use conflict::{EntityConflict, Resolution, SuggestedResolution};
pub use log_entry::{ApplicationStatus, OpSource, OperationLogEntry};
pub use operation::{OpType, Operation, OperationDraft, SchemaVersion};
pub use snapshot::Snapshot;

/// Errors raised while validating model values.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("invalid operation {op_id}: {reason}")]
    InvalidOperation { op_id: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
