#![allow(dead_code)]

use oplog_clock::VectorClock;
use oplog_model::{OpType, Operation, OperationDraft};
use oplog_store::MemoryOpLogStore;
use oplog_sync::{MemoryDomainState, RecordingNotifier, SyncConfig, SyncContext, SyncEngine};
use oplog_types::{ClientId, EntityType};
use serde_json::{json, Value};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Routes engine logs to the test output. Filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn clock(entries: &[(&str, u64)]) -> VectorClock {
    entries.iter().map(|(k, v)| (*k, *v)).collect()
}

pub fn task_op(client: &str, op_type: OpType, id: &str, payload: Value, vc: &[(&str, u64)]) -> Operation {
    Operation::new(ClientId::from(client), op_type, EntityType::Task, id, payload, clock(vc))
}

pub fn create_task(id: &str, title: &str) -> OperationDraft {
    OperationDraft::new(OpType::Create, EntityType::Task, id, json!({ "title": title }))
}

pub fn update_task(id: &str, title: &str) -> OperationDraft {
    OperationDraft::new(OpType::Update, EntityType::Task, id, json!({ "title": title }))
}

/// One replica with in-memory collaborators.
pub struct Replica {
    pub engine: SyncEngine,
    pub store: Arc<MemoryOpLogStore>,
    pub domain: Arc<MemoryDomainState>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Replica {
    pub fn new(client: &str) -> Self {
        Self::with_config(client, SyncConfig::default())
    }

    pub fn with_config(client: &str, config: SyncConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryOpLogStore::new());
        let domain = Arc::new(MemoryDomainState::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = SyncContext::new(ClientId::from(client), config, store.clone(), domain.clone())
            .with_notifier(notifier.clone());
        Self {
            engine: SyncEngine::new(ctx),
            store,
            domain,
            notifier,
        }
    }

    pub fn ctx(&self) -> &SyncContext {
        self.engine.context()
    }

    pub async fn title(&self, id: &str) -> Option<String> {
        let key = oplog_types::EntityKey::new(EntityType::Task, id);
        oplog_sync::DomainState::entity_state(self.domain.as_ref(), &key)
            .await
            .unwrap()
            .and_then(|v| v.get("title").and_then(Value::as_str).map(str::to_owned))
    }
}
