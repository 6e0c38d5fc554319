//! SQLite-backed operation log.
//!
//! Operations are stored as JSON next to the columns the engine filters on.
//! An `op_entities` side table indexes every entity key an operation
//! touches. The global vector clock and the snapshot live in `meta`.

use crate::store::is_compactable;
use crate::{OpLogStore, StorageError, StorageResult};
use async_trait::async_trait;
use oplog_clock::VectorClock;
use oplog_model::{ApplicationStatus, OpSource, Operation, OperationLogEntry, Snapshot};
use oplog_types::{now_millis, EntityKey, OpId};
use rusqlite::{params, Connection, OptionalExtension, Params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

const ENTRY_COLUMNS: &str = "seq, source, applied_at, synced_at, rejected_at, status, \
                             pending_apply, retry_count, op_json";

const META_VECTOR_CLOCK: &str = "vector_clock";
const META_SNAPSHOT: &str = "snapshot";

/// Operation log persisted in a SQLite database.
#[derive(Clone)]
pub struct SqliteOpLogStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteOpLogStore {
    /// Opens (or creates) an operation log at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::with_connection(conn)
    }

    /// Opens an in-memory operation log (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StorageError::LockPoisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StorageError::Task(e.to_string()))?
    }
}

fn init_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS ops (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            op_id TEXT NOT NULL UNIQUE,
            source TEXT NOT NULL,
            applied_at INTEGER,
            synced_at INTEGER,
            rejected_at INTEGER,
            status TEXT NOT NULL,
            pending_apply INTEGER NOT NULL DEFAULT 0,
            retry_count INTEGER NOT NULL DEFAULT 0,
            op_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS op_entities (
            seq INTEGER NOT NULL,
            entity_key TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_op_entities_key ON op_entities(entity_key);
        CREATE INDEX IF NOT EXISTS idx_op_entities_seq ON op_entities(seq);

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

fn source_str(source: OpSource) -> &'static str {
    match source {
        OpSource::Local => "local",
        OpSource::Remote => "remote",
    }
}

fn parse_source(s: &str) -> StorageResult<OpSource> {
    match s {
        "local" => Ok(OpSource::Local),
        "remote" => Ok(OpSource::Remote),
        other => Err(StorageError::InvalidData(format!("unknown source {other}"))),
    }
}

fn parse_status(s: &str) -> StorageResult<ApplicationStatus> {
    match s {
        "pending" => Ok(ApplicationStatus::Pending),
        "applied" => Ok(ApplicationStatus::Applied),
        "failed" => Ok(ApplicationStatus::Failed),
        other => Err(StorageError::InvalidData(format!("unknown status {other}"))),
    }
}

struct RawEntry {
    seq: i64,
    source: String,
    applied_at: Option<i64>,
    synced_at: Option<i64>,
    rejected_at: Option<i64>,
    status: String,
    pending_apply: bool,
    retry_count: i64,
    op_json: String,
}

impl RawEntry {
    fn into_entry(self) -> StorageResult<OperationLogEntry> {
        Ok(OperationLogEntry {
            seq: u64::try_from(self.seq)
                .map_err(|_| StorageError::InvalidData(format!("negative seq {}", self.seq)))?,
            op: serde_json::from_str(&self.op_json)?,
            source: parse_source(&self.source)?,
            applied_at: self.applied_at,
            synced_at: self.synced_at,
            rejected_at: self.rejected_at,
            application_status: parse_status(&self.status)?,
            pending_apply: self.pending_apply,
            retry_count: u32::try_from(self.retry_count).unwrap_or(u32::MAX),
        })
    }
}

fn read_entries<P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> StorageResult<Vec<OperationLogEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let raw = stmt
        .query_map(params, |row| {
            Ok(RawEntry {
                seq: row.get(0)?,
                source: row.get(1)?,
                applied_at: row.get(2)?,
                synced_at: row.get(3)?,
                rejected_at: row.get(4)?,
                status: row.get(5)?,
                pending_apply: row.get(6)?,
                retry_count: row.get(7)?,
                op_json: row.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawEntry::into_entry).collect()
}

fn load_meta<T: serde::de::DeserializeOwned>(conn: &Connection, key: &str) -> StorageResult<Option<T>> {
    let value: Option<String> = conn
        .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
        .optional()?;
    value.map(|v| serde_json::from_str(&v)).transpose().map_err(Into::into)
}

fn save_meta<T: serde::Serialize>(conn: &Connection, key: &str, value: &T) -> StorageResult<()> {
    let json = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, json],
    )?;
    Ok(())
}

fn ids_to_strings(ids: &[OpId]) -> Vec<String> {
    ids.iter().map(ToString::to_string).collect()
}

#[async_trait]
impl OpLogStore for SqliteOpLogStore {
    async fn append(
        &self,
        op: &Operation,
        source: OpSource,
        pending_apply: bool,
    ) -> StorageResult<u64> {
        let op = op.clone();
        self.run(move |conn| {
            let op_id = op.id.to_string();
            let existing: Option<i64> = conn
                .query_row("SELECT seq FROM ops WHERE op_id = ?1", params![op_id], |row| row.get(0))
                .optional()?;
            if let Some(seq) = existing {
                return Ok(seq as u64);
            }

            let now = now_millis();
            let status = if pending_apply {
                ApplicationStatus::Pending
            } else {
                ApplicationStatus::Applied
            };
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO ops (op_id, source, applied_at, synced_at, status, pending_apply, op_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    op_id,
                    source_str(source),
                    (!pending_apply).then_some(now),
                    (source == OpSource::Remote).then_some(now),
                    status.as_str(),
                    pending_apply,
                    serde_json::to_string(&op)?,
                ],
            )?;
            let seq = tx.last_insert_rowid();
            for key in op.entity_keys() {
                tx.execute(
                    "INSERT INTO op_entities (seq, entity_key) VALUES (?1, ?2)",
                    params![seq, key.to_string()],
                )?;
            }
            tx.commit()?;
            Ok(seq as u64)
        })
        .await
    }

    async fn has_op(&self, id: &OpId) -> StorageResult<bool> {
        let id = id.to_string();
        self.run(move |conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM ops WHERE op_id = ?1", params![id], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn get_op_by_id(&self, id: &OpId) -> StorageResult<Option<OperationLogEntry>> {
        let id = id.to_string();
        self.run(move |conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM ops WHERE op_id = ?1");
            Ok(read_entries(conn, &sql, params![id])?.into_iter().next())
        })
        .await
    }

    async fn mark_applied(&self, seqs: &[u64]) -> StorageResult<()> {
        let seqs = seqs.to_vec();
        self.run(move |conn| {
            let now = now_millis();
            let tx = conn.transaction()?;
            for seq in seqs {
                tx.execute(
                    "UPDATE ops SET status = 'applied', applied_at = ?2, pending_apply = 0
                     WHERE seq = ?1",
                    params![seq as i64, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn mark_failed(&self, ids: &[OpId], max_retries: u32) -> StorageResult<()> {
        let ids = ids_to_strings(ids);
        self.run(move |conn| {
            let now = now_millis();
            let tx = conn.transaction()?;
            for id in ids {
                tx.execute(
                    "UPDATE ops SET status = 'failed', pending_apply = 0,
                        retry_count = retry_count + 1,
                        rejected_at = CASE
                            WHEN retry_count + 1 > ?2 AND rejected_at IS NULL THEN ?3
                            ELSE rejected_at END
                     WHERE op_id = ?1",
                    params![id, max_retries, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn mark_synced(&self, seqs: &[u64]) -> StorageResult<()> {
        let seqs = seqs.to_vec();
        self.run(move |conn| {
            let now = now_millis();
            let tx = conn.transaction()?;
            for seq in seqs {
                tx.execute(
                    "UPDATE ops SET synced_at = COALESCE(synced_at, ?2) WHERE seq = ?1",
                    params![seq as i64, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn mark_rejected(&self, ids: &[OpId]) -> StorageResult<()> {
        let ids = ids_to_strings(ids);
        self.run(move |conn| {
            let now = now_millis();
            let tx = conn.transaction()?;
            for id in ids {
                tx.execute(
                    "UPDATE ops SET rejected_at = COALESCE(rejected_at, ?2), pending_apply = 0 WHERE op_id = ?1",
                    params![id, now],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_unsynced(&self) -> StorageResult<Vec<OperationLogEntry>> {
        self.run(|conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM ops
                 WHERE source = 'local' AND synced_at IS NULL AND rejected_at IS NULL
                 ORDER BY seq"
            );
            read_entries(conn, &sql, [])
        })
        .await
    }

    async fn get_by_entity(&self, key: &EntityKey) -> StorageResult<Vec<OperationLogEntry>> {
        let key = key.to_string();
        self.run(move |conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM ops
                 WHERE seq IN (SELECT seq FROM op_entities WHERE entity_key = ?1)
                 ORDER BY seq"
            );
            read_entries(conn, &sql, params![key])
        })
        .await
    }

    async fn get_by_status(
        &self,
        status: ApplicationStatus,
    ) -> StorageResult<Vec<OperationLogEntry>> {
        self.run(move |conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM ops WHERE status = ?1 ORDER BY seq");
            read_entries(conn, &sql, params![status.as_str()])
        })
        .await
    }

    async fn get_ops_after_seq(&self, after: u64) -> StorageResult<Vec<OperationLogEntry>> {
        self.run(move |conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM ops WHERE seq > ?1 ORDER BY seq");
            read_entries(conn, &sql, params![after as i64])
        })
        .await
    }

    async fn get_pending_apply(&self) -> StorageResult<Vec<OperationLogEntry>> {
        self.run(|conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM ops WHERE pending_apply = 1 ORDER BY seq");
            read_entries(conn, &sql, [])
        })
        .await
    }

    async fn last_seq(&self) -> StorageResult<u64> {
        self.run(|conn| {
            let seq: Option<i64> = conn
                .query_row("SELECT seq FROM sqlite_sequence WHERE name = 'ops'", [], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(seq.map_or(0, |s| s.max(0) as u64))
        })
        .await
    }

    async fn delete_compactable(
        &self,
        up_to_seq: u64,
        settled_before: i64,
    ) -> StorageResult<usize> {
        self.run(move |conn| {
            let sql = format!("SELECT {ENTRY_COLUMNS} FROM ops WHERE seq <= ?1 ORDER BY seq");
            let doomed: Vec<i64> = read_entries(conn, &sql, params![up_to_seq as i64])?
                .into_iter()
                .filter(|e| is_compactable(e, up_to_seq, settled_before))
                .map(|e| e.seq as i64)
                .collect();

            let tx = conn.transaction()?;
            for seq in &doomed {
                tx.execute("DELETE FROM op_entities WHERE seq = ?1", params![seq])?;
                tx.execute("DELETE FROM ops WHERE seq = ?1", params![seq])?;
            }
            tx.commit()?;
            debug!("deleted {} compacted entries up to seq {}", doomed.len(), up_to_seq);
            Ok(doomed.len())
        })
        .await
    }

    async fn load_vector_clock(&self) -> StorageResult<Option<VectorClock>> {
        self.run(|conn| load_meta(conn, META_VECTOR_CLOCK)).await
    }

    async fn save_vector_clock(&self, clock: &VectorClock) -> StorageResult<()> {
        let clock = clock.clone();
        self.run(move |conn| save_meta(conn, META_VECTOR_CLOCK, &clock)).await
    }

    async fn load_snapshot(&self) -> StorageResult<Option<Snapshot>> {
        self.run(|conn| load_meta(conn, META_SNAPSHOT)).await
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> StorageResult<()> {
        let snapshot = snapshot.clone();
        self.run(move |conn| save_meta(conn, META_SNAPSHOT, &snapshot)).await
    }
}
