//! Explicit handle bundling the stores and collaborators every component
//! needs. Components receive a clone at construction.

use crate::config::SyncConfig;
use crate::domain::{
    AutoPrompt, BackupService, DomainState, NoopBackup, NoopValidator, StateValidator,
    SyncNotifier, TracingNotifier, UserPrompt,
};
use crate::lock::LockService;
use oplog_store::{OpLogStore, VectorClockStore};
use oplog_types::ClientId;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct SyncContext {
    pub client_id: ClientId,
    pub config: Arc<SyncConfig>,
    pub store: Arc<dyn OpLogStore>,
    pub clocks: VectorClockStore,
    pub domain: Arc<dyn DomainState>,
    pub validator: Arc<dyn StateValidator>,
    pub backup: Arc<dyn BackupService>,
    pub prompt: Arc<dyn UserPrompt>,
    pub notifier: Arc<dyn SyncNotifier>,
    pub locks: Arc<LockService>,
}

impl SyncContext {
    /// Creates a context with default collaborators: no-op validation and
    /// backup, auto-accepting prompt, tracing notifier.
    pub fn new(
        client_id: ClientId,
        config: SyncConfig,
        store: Arc<dyn OpLogStore>,
        domain: Arc<dyn DomainState>,
    ) -> Self {
        Self {
            client_id,
            config: Arc::new(config),
            clocks: VectorClockStore::new(Arc::clone(&store)),
            store,
            domain,
            validator: Arc::new(NoopValidator),
            backup: Arc::new(NoopBackup),
            prompt: Arc::new(AutoPrompt),
            notifier: Arc::new(TracingNotifier),
            locks: Arc::new(LockService::new()),
        }
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn StateValidator>) -> Self {
        self.validator = validator;
        self
    }

    #[must_use]
    pub fn with_backup(mut self, backup: Arc<dyn BackupService>) -> Self {
        self.backup = backup;
        self
    }

    #[must_use]
    pub fn with_prompt(mut self, prompt: Arc<dyn UserPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn SyncNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Runs the validation checkpoint. Failures are logged, never raised.
    pub(crate) async fn checkpoint(&self, context: &str) {
        match self.validator.validate_and_repair(context).await {
            Ok(true) => {}
            Ok(false) => warn!("validation checkpoint found unrepaired state after {context}"),
            Err(e) => warn!("validation checkpoint failed after {context}: {e}"),
        }
    }
}
