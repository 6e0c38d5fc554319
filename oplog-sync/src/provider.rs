//! Sync server abstraction.
//!
//! A [`SyncProvider`] moves operations between this replica and the server.
//! It is passed per call, so one engine can talk to different backends.

use crate::error::SyncResult;
use async_trait::async_trait;
use oplog_clock::VectorClock;
use oplog_model::Operation;
use oplog_types::{ClientId, OpId};
use serde::{Deserialize, Serialize};

/// Why the server refused an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The operation's clock does not follow the entity's latest server
    /// clock.
    #[serde(alias = "CONFLICT_CONCURRENT", alias = "CONFLICT_STALE")]
    ConcurrentModification,
    /// Transient server failure; retry later.
    InternalError,
    StorageQuotaExceeded,
    ValidationError,
    DuplicateOperation,
    #[serde(other)]
    Unknown,
}

/// An operation as stored by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerOperation {
    pub server_seq: u64,
    pub op: Operation,
}

/// Per-operation upload outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub op_id: OpId,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

impl UploadResult {
    #[must_use]
    pub fn accepted(op_id: OpId) -> Self {
        Self {
            op_id,
            accepted: true,
            error: None,
            error_code: None,
        }
    }

    #[must_use]
    pub fn rejected(op_id: OpId, code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            op_id,
            accepted: false,
            error: Some(error.into()),
            error_code: Some(code),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub results: Vec<UploadResult>,
    pub latest_seq: u64,
    /// Operations from other clients since the uploader's last known seq.
    #[serde(default)]
    pub piggybacked_ops: Vec<ServerOperation>,
    #[serde(default)]
    pub has_more_piggyback: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub ops: Vec<ServerOperation>,
    pub has_more: bool,
    pub latest_seq: u64,
    /// Merge of the clocks of operations skipped because a later full-state
    /// operation supersedes them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_vector_clock: Option<VectorClock>,
}

/// A server rejection as handed to the rejected-ops handler.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedOp {
    pub op_id: OpId,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
}

impl From<&UploadResult> for RejectedOp {
    fn from(result: &UploadResult) -> Self {
        Self {
            op_id: result.op_id,
            error: result.error.clone(),
            error_code: result.error_code,
        }
    }
}

/// Why a full snapshot is uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotReason {
    Initial,
    Recovery,
    Migration,
}

/// Transport to the sync server.
#[async_trait]
pub trait SyncProvider: Send + Sync {
    /// Uploads operations. The response may piggyback operations from other
    /// clients newer than `last_known_server_seq`.
    async fn upload_ops(
        &self,
        ops: &[Operation],
        client_id: &ClientId,
        last_known_server_seq: u64,
    ) -> SyncResult<UploadResponse>;

    /// Downloads up to `limit` operations with a server seq above `since`,
    /// leaving out operations authored by `exclude_client`.
    async fn download_ops(
        &self,
        since: u64,
        exclude_client: Option<&ClientId>,
        limit: usize,
    ) -> SyncResult<DownloadResponse>;

    /// Uploads the whole state as a full-state operation. Returns the
    /// server seq it was stored at.
    async fn upload_snapshot(
        &self,
        state: serde_json::Value,
        client_id: &ClientId,
        reason: SnapshotReason,
        vector_clock: &VectorClock,
        schema_version: u32,
    ) -> SyncResult<u64>;

    async fn get_last_server_seq(&self) -> SyncResult<u64>;

    async fn set_last_server_seq(&self, seq: u64) -> SyncResult<()>;
}

/// An in-memory sync server for tests and local development.
pub mod mock {
    use super::*;
    use crate::error::SyncError;
    use oplog_clock::CausalOrder;
    use oplog_model::OpType;
    use oplog_types::EntityKey;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use tracing::debug;

    #[derive(Debug, Default)]
    struct ServerState {
        log: Vec<ServerOperation>,
        ids: HashSet<OpId>,
        /// Merge of accepted clocks per entity since the last full-state op.
        entity_clocks: HashMap<EntityKey, VectorClock>,
        /// Scripted rejections, consumed on use.
        scripted: HashMap<OpId, ErrorCode>,
        offline: bool,
    }

    /// Shared server. Clone the `Arc` into one [`InMemoryProvider`] per
    /// client.
    ///
    /// Uploads are rejected with [`ErrorCode::ConcurrentModification`] when
    /// the op's clock does not strictly follow everything the server has
    /// accepted for the same entity. Downloads from seq 0 start at the
    /// latest full-state op and report the merged clock of what they skip.
    #[derive(Debug, Default)]
    pub struct InMemorySyncServer {
        state: Mutex<ServerState>,
    }

    impl InMemorySyncServer {
        #[must_use]
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn lock(&self) -> MutexGuard<'_, ServerState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Number of operations stored.
        pub fn op_count(&self) -> usize {
            self.lock().log.len()
        }

        pub fn latest_seq(&self) -> u64 {
            self.lock().log.last().map_or(0, |s| s.server_seq)
        }

        /// Every stored operation, in server order.
        pub fn ops(&self) -> Vec<ServerOperation> {
            self.lock().log.clone()
        }

        /// Rejects the next upload of `op_id` with `code`.
        pub fn script_rejection(&self, op_id: OpId, code: ErrorCode) {
            self.lock().scripted.insert(op_id, code);
        }

        /// While offline every call fails with a network error.
        pub fn set_offline(&self, offline: bool) {
            self.lock().offline = offline;
        }

        fn check_online(state: &ServerState) -> SyncResult<()> {
            if state.offline {
                return Err(SyncError::Network("server unreachable".into()));
            }
            Ok(())
        }

        fn store(state: &mut ServerState, op: Operation) -> u64 {
            let seq = state.log.last().map_or(0, |s| s.server_seq) + 1;
            if op.is_full_state() {
                state.entity_clocks.clear();
            } else {
                for key in op.entity_keys() {
                    state.entity_clocks.entry(key).or_default().merge(&op.vector_clock);
                }
            }
            state.ids.insert(op.id);
            state.log.push(ServerOperation { server_seq: seq, op });
            seq
        }

        fn accept(state: &mut ServerState, op: &Operation) -> UploadResult {
            if let Some(code) = state.scripted.remove(&op.id) {
                return UploadResult::rejected(op.id, code, "scripted rejection");
            }
            if state.ids.contains(&op.id) {
                return UploadResult::accepted(op.id);
            }
            if let Err(e) = op.validate() {
                return UploadResult::rejected(op.id, ErrorCode::ValidationError, e.to_string());
            }
            if !op.is_full_state() && op.op_type != OpType::Batch {
                for key in op.entity_keys() {
                    let Some(latest) = state.entity_clocks.get(&key) else {
                        continue;
                    };
                    if op.vector_clock.compare(latest) != CausalOrder::After {
                        return UploadResult::rejected(
                            op.id,
                            ErrorCode::ConcurrentModification,
                            format!("{key} was modified concurrently"),
                        );
                    }
                }
            }
            Self::store(state, op.clone());
            UploadResult::accepted(op.id)
        }

        fn page(
            state: &ServerState,
            since: u64,
            exclude: Option<&ClientId>,
            limit: usize,
        ) -> (Vec<ServerOperation>, bool) {
            let mut matching = state
                .log
                .iter()
                .filter(|s| s.server_seq > since && exclude != Some(&s.op.client_id));
            let ops: Vec<ServerOperation> = matching.by_ref().take(limit.max(1)).cloned().collect();
            let has_more = matching.next().is_some();
            (ops, has_more)
        }
    }

    /// One client's connection to an [`InMemorySyncServer`].
    #[derive(Debug)]
    pub struct InMemoryProvider {
        server: Arc<InMemorySyncServer>,
        last_server_seq: Mutex<u64>,
    }

    impl InMemoryProvider {
        pub fn new(server: Arc<InMemorySyncServer>) -> Self {
            Self {
                server,
                last_server_seq: Mutex::new(0),
            }
        }

        pub fn server(&self) -> &Arc<InMemorySyncServer> {
            &self.server
        }
    }

    #[async_trait]
    impl SyncProvider for InMemoryProvider {
        async fn upload_ops(
            &self,
            ops: &[Operation],
            client_id: &ClientId,
            last_known_server_seq: u64,
        ) -> SyncResult<UploadResponse> {
            let mut state = self.server.lock();
            InMemorySyncServer::check_online(&state)?;
            let results: Vec<UploadResult> =
                ops.iter().map(|op| InMemorySyncServer::accept(&mut state, op)).collect();
            let accepted = results.iter().filter(|r| r.accepted).count();
            debug!("server accepted {accepted}/{} ops from {client_id}", ops.len());

            let (piggybacked_ops, has_more_piggyback) =
                InMemorySyncServer::page(&state, last_known_server_seq, Some(client_id), 500);
            Ok(UploadResponse {
                results,
                latest_seq: state.log.last().map_or(0, |s| s.server_seq),
                piggybacked_ops,
                has_more_piggyback,
            })
        }

        async fn download_ops(
            &self,
            since: u64,
            exclude_client: Option<&ClientId>,
            limit: usize,
        ) -> SyncResult<DownloadResponse> {
            let state = self.server.lock();
            InMemorySyncServer::check_online(&state)?;
            let latest_seq = state.log.last().map_or(0, |s| s.server_seq);

            let mut since = since;
            let mut snapshot_vector_clock = None;
            let latest_import = state
                .log
                .iter()
                .rev()
                .find(|s| s.op.is_full_state())
                .map(|s| s.server_seq);
            if let Some(import_seq) = latest_import.filter(|&seq| since + 1 < seq) {
                let skipped = state
                    .log
                    .iter()
                    .filter(|s| s.server_seq > since && s.server_seq < import_seq)
                    .map(|s| &s.op.vector_clock);
                snapshot_vector_clock = Some(VectorClock::merge_all(skipped));
                since = import_seq - 1;
            }

            let (ops, has_more) = InMemorySyncServer::page(&state, since, exclude_client, limit);
            Ok(DownloadResponse {
                ops,
                has_more,
                latest_seq,
                snapshot_vector_clock,
            })
        }

        async fn upload_snapshot(
            &self,
            state_value: serde_json::Value,
            client_id: &ClientId,
            reason: SnapshotReason,
            vector_clock: &VectorClock,
            schema_version: u32,
        ) -> SyncResult<u64> {
            let mut state = self.server.lock();
            InMemorySyncServer::check_online(&state)?;
            let op_type = match reason {
                SnapshotReason::Recovery => OpType::Repair,
                SnapshotReason::Initial | SnapshotReason::Migration => OpType::SyncImport,
            };
            let op = Operation::full_state(
                client_id.clone(),
                op_type,
                state_value,
                vector_clock.clone(),
            )
            .with_schema_version(schema_version);
            Ok(InMemorySyncServer::store(&mut state, op))
        }

        async fn get_last_server_seq(&self) -> SyncResult<u64> {
            Ok(*self.last_server_seq.lock().unwrap_or_else(PoisonError::into_inner))
        }

        async fn set_last_server_seq(&self, seq: u64) -> SyncResult<()> {
            *self.last_server_seq.lock().unwrap_or_else(PoisonError::into_inner) = seq;
            Ok(())
        }
    }
}
