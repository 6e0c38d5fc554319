//! Offline-first synchronization engine for the operation log.
//!
//! Every replica records its changes as operations stamped with a vector
//! clock, applies them locally right away, and exchanges them with a sync
//! server when it can.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Detector**: classifies remote operations against each entity's local
//!   frontier (apply, stale, duplicate, conflict)
//! - **Resolver**: last-writer-wins or user-driven conflict resolution
//! - **Applier**: crash-safe, dependency-ordered application
//! - **Migration**: schema-version skew between builds
//! - **Import**: full-state imports and replay of own work after them
//! - **Compactor**: snapshots and log truncation
//! - **Rejected / Stale**: settling operations the server refused
//! - **Engine**: local capture, hydration and the sync cycle
//!
//! ## Sync Process
//!
//! 1. **Download**: fetch operations after the last known server seq
//! 2. **Migrate**: bring them to this build's schema version
//! 3. **Filter**: drop operations invalidated by a full-state import
//! 4. **Detect**: compare against entity frontiers under the log lock
//! 5. **Resolve / Apply**: settle conflicts, apply the rest
//! 6. **Upload**: push pending local operations, handle rejections
//!
//! # Example
//!
//! ```
//! use oplog_store::MemoryOpLogStore;
//! use oplog_sync::{MemoryDomainState, SyncConfig, SyncContext, SyncEngine};
//! use oplog_types::ClientId;
//! use std::sync::Arc;
//!
//! let ctx = SyncContext::new(
//!     ClientId::generate(),
//!     SyncConfig::default(),
//!     Arc::new(MemoryOpLogStore::new()),
//!     Arc::new(MemoryDomainState::new()),
//! );
//! let engine = SyncEngine::new(ctx);
//! ```

pub mod applier;
pub mod compactor;
mod config;
mod context;
pub mod dependency;
pub mod detector;
pub mod domain;
mod engine;
mod error;
pub mod import;
pub mod lock;
pub mod migration;
pub mod pipeline;
pub mod provider;
pub mod rejected;
pub mod resolver;
pub mod stale;

pub use applier::{ApplyOptions, ApplyResult, OperationApplier};
pub use compactor::{CompactionReport, Compactor};
pub use config::{ConflictStrategy, SyncConfig};
pub use context::SyncContext;
pub use dependency::{sort_by_dependency, DependencyResolver};
pub use detector::{ConflictDetector, DetectionResult};
pub use domain::{
    BackupService, DomainState, MemoryDomainState, RecordingNotifier, StateValidator, SyncNotice,
    SyncNotifier, UserPrompt,
};
pub use engine::{HydrationReport, SyncEngine, SyncReport, UploadOutcome};
pub use error::{SyncError, SyncResult};
pub use import::FullStateImportHandler;
pub use lock::{LockName, LockService};
pub use migration::{SchemaMigration, SchemaMigrator};
pub use pipeline::{ProcessOutcome, RemoteOpsProcessor};
pub use provider::{SnapshotReason, SyncProvider};
pub use rejected::{DownloadOutcome, RejectedOpsHandler};
pub use resolver::ConflictResolver;
pub use stale::StaleOperationResolver;
