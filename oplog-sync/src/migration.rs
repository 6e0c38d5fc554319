//! Schema-version skew handling.
//!
//! Every operation and snapshot carries a schema version. Older versions are
//! migrated forward step by step; versions too far ahead of this build block
//! the whole batch so nothing is half-applied.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use oplog_model::{Operation, SchemaVersion, Snapshot};
use oplog_types::{EntityId, OpId};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Upgrades a state cache by one version.
pub type StateMigrationFn = fn(Value) -> Result<Value, String>;

/// Upgrades one operation by one version, or drops it (`None`).
pub type OperationMigrationFn = fn(Operation) -> Option<Operation>;

/// One step in the migration chain, `from_version` to `from_version + 1`.
#[derive(Clone)]
pub struct SchemaMigration {
    pub from_version: u32,
    pub description: &'static str,
    pub migrate_state: StateMigrationFn,
    pub migrate_operation: Option<OperationMigrationFn>,
    /// Declares that operations written before this step must be rewritten.
    pub requires_operation_migration: bool,
}

impl std::fmt::Debug for SchemaMigration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaMigration")
            .field("from_version", &self.from_version)
            .field("description", &self.description)
            .field("requires_operation_migration", &self.requires_operation_migration)
            .finish()
    }
}

/// Result of migrating a batch of remote operations.
#[derive(Debug, Default)]
pub struct MigrationOutcome {
    pub ops: Vec<Operation>,
    pub dropped_op_ids: Vec<OpId>,
    /// Entity ids targeted by dropped operations.
    pub dropped_entity_ids: HashSet<EntityId>,
    /// Set the first time this session sees an op from a newer build.
    pub newer_version_seen: Option<u32>,
}

pub struct SchemaMigrator {
    current_version: u32,
    min_supported: u32,
    max_supported: u32,
    migrations: Vec<SchemaMigration>,
    warned_newer: AtomicBool,
}

impl SchemaMigrator {
    /// A migrator with no registered migrations.
    #[must_use]
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            current_version: config.current_schema_version,
            min_supported: config.min_supported_schema_version,
            max_supported: config.max_supported_schema_version(),
            migrations: Vec::new(),
            warned_newer: AtomicBool::new(false),
        }
    }

    /// A migrator with a registry. Each step must start where the previous
    /// one ended, and steps that require operation migration must provide an
    /// operation migrator.
    pub fn with_migrations(
        config: &SyncConfig,
        mut migrations: Vec<SchemaMigration>,
    ) -> SyncResult<Self> {
        migrations.sort_by_key(|m| m.from_version);
        for m in &migrations {
            if m.requires_operation_migration && m.migrate_operation.is_none() {
                return Err(SyncError::Migration(format!(
                    "migration from v{} ({}) requires operation migration but has no operation migrator",
                    m.from_version, m.description
                )));
            }
            if m.from_version >= config.current_schema_version {
                return Err(SyncError::Migration(format!(
                    "migration from v{} is not below current version {}",
                    m.from_version, config.current_schema_version
                )));
            }
        }
        for pair in migrations.windows(2) {
            if pair[1].from_version != pair[0].from_version + 1 {
                return Err(SyncError::Migration(format!(
                    "migration chain gap between v{} and v{}",
                    pair[0].from_version, pair[1].from_version
                )));
            }
        }
        let mut migrator = Self::new(config);
        migrator.migrations = migrations;
        Ok(migrator)
    }

    #[must_use]
    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    fn steps_from(&self, version: u32) -> impl Iterator<Item = &SchemaMigration> {
        self.migrations
            .iter()
            .filter(move |m| m.from_version >= version && m.from_version < self.current_version)
    }

    fn check_version(&self, op: &Operation) -> SyncResult<()> {
        let version = op.schema_version.get();
        if version > self.max_supported {
            return Err(SyncError::SchemaTooNew {
                op_id: op.id.to_string(),
                version,
                max_supported: self.max_supported,
            });
        }
        if version < self.min_supported {
            return Err(SyncError::SchemaTooOld {
                op_id: op.id.to_string(),
                version,
                min_supported: self.min_supported,
            });
        }
        Ok(())
    }

    /// Migrates one operation to the current version. `Ok(None)` means the
    /// operation no longer has meaning and is dropped.
    pub fn migrate_operation(&self, op: Operation) -> SyncResult<Option<Operation>> {
        self.check_version(&op)?;
        let version = op.schema_version.get();
        if version >= self.current_version {
            return Ok(Some(op));
        }
        let mut op = op;
        for step in self.steps_from(version) {
            if let Some(migrate) = step.migrate_operation {
                match migrate(op) {
                    Some(next) => op = next,
                    None => {
                        debug!("migration v{} dropped an operation", step.from_version);
                        return Ok(None);
                    }
                }
            }
        }
        op.schema_version = SchemaVersion::V(self.current_version);
        Ok(Some(op))
    }

    /// Migrates a batch. Any operation outside the supported window fails
    /// the whole batch before anything is migrated.
    pub fn migrate_batch(&self, ops: Vec<Operation>) -> SyncResult<MigrationOutcome> {
        for op in &ops {
            self.check_version(op)?;
        }

        let mut outcome = MigrationOutcome::default();
        let newest = ops.iter().map(|op| op.schema_version.get()).max().unwrap_or(0);
        if newest > self.current_version && !self.warned_newer.swap(true, Ordering::Relaxed) {
            info!("received operations from newer schema v{newest} (this build writes v{})", self.current_version);
            outcome.newer_version_seen = Some(newest);
        }

        for op in ops {
            let id = op.id;
            let targets = op.target_ids();
            match self.migrate_operation(op)? {
                Some(migrated) => outcome.ops.push(migrated),
                None => {
                    outcome.dropped_op_ids.push(id);
                    outcome.dropped_entity_ids.extend(targets);
                }
            }
        }
        if !outcome.dropped_op_ids.is_empty() {
            warn!("schema migration dropped {} operations", outcome.dropped_op_ids.len());
        }
        Ok(outcome)
    }

    /// Migrates a snapshot's state cache to the current version.
    pub fn migrate_snapshot(&self, mut snapshot: Snapshot) -> SyncResult<Snapshot> {
        if snapshot.schema_version > self.max_supported {
            return Err(SyncError::SchemaTooNew {
                op_id: "snapshot".into(),
                version: snapshot.schema_version,
                max_supported: self.max_supported,
            });
        }
        if snapshot.schema_version >= self.current_version {
            return Ok(snapshot);
        }
        for step in self.steps_from(snapshot.schema_version) {
            info!("migrating snapshot state: {}", step.description);
            snapshot.state = (step.migrate_state)(snapshot.state).map_err(SyncError::Migration)?;
        }
        snapshot.schema_version = self.current_version;
        Ok(snapshot)
    }
}
