use crate::Operation;
use serde::{Deserialize, Serialize};

/// Where an operation in the local log came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpSource {
    Local,
    Remote,
}

/// Whether an entry has been applied to domain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStatus {
    Pending,
    Applied,
    Failed,
}

impl ApplicationStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Applied => "applied",
            ApplicationStatus::Failed => "failed",
        }
    }
}

/// An operation plus its local bookkeeping.
///
/// Entries only change through status transitions and are removed only by
/// compaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationLogEntry {
    pub seq: u64,
    pub op: Operation,
    pub source: OpSource,
    pub applied_at: Option<i64>,
    pub synced_at: Option<i64>,
    pub rejected_at: Option<i64>,
    pub application_status: ApplicationStatus,
    /// Set while the entry is stored but not yet applied. A crash leaves it
    /// set, and startup recovery re-applies the entry.
    pub pending_apply: bool,
    pub retry_count: u32,
}

impl OperationLogEntry {
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.synced_at.is_some()
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.rejected_at.is_some()
    }

    /// Local, not yet accepted by the server and not rejected.
    #[must_use]
    pub fn is_pending_upload(&self) -> bool {
        self.source == OpSource::Local && self.synced_at.is_none() && self.rejected_at.is_none()
    }
}
