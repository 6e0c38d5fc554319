//! Sync engine: local capture, hydration and the upload/download cycle.
//!
//! The engine owns no I/O. A [`SyncProvider`] is passed to every call that
//! talks to the server.

use crate::applier::{ApplyOptions, OperationApplier};
use crate::compactor::{CompactionReport, Compactor};
use crate::context::SyncContext;
use crate::dependency::sort_by_dependency;
use crate::error::{SyncError, SyncResult};
use crate::lock::LockName;
use crate::migration::{SchemaMigration, SchemaMigrator};
use crate::pipeline::RemoteOpsProcessor;
use crate::provider::{RejectedOp, SnapshotReason, SyncProvider};
use crate::rejected::{DownloadCallback, DownloadOutcome, RejectedOpsHandler};
use async_trait::async_trait;
use oplog_model::{
    ApplicationStatus, OpSource, OpType, Operation, OperationDraft, OperationLogEntry,
};
use oplog_types::{ClientId, OpId};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What [`SyncEngine::hydrate`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HydrationReport {
    pub snapshot_restored: bool,
    /// Log entries replayed on top of the snapshot.
    pub replayed: usize,
    /// Entries left pending or failed that were applied now.
    pub recovered: usize,
}

/// What [`SyncEngine::upload_pending_ops`] did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub uploaded: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// Remote operations received with upload responses and applied.
    pub piggybacked_applied: usize,
    /// Local-win or replacement operations created; they need another
    /// upload.
    pub new_local_ops: usize,
}

/// What one [`SyncEngine::sync`] cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub rounds: u32,
    pub downloaded: usize,
    pub uploaded: usize,
}

pub struct SyncEngine {
    ctx: SyncContext,
    migrator: Arc<SchemaMigrator>,
    pipeline: RemoteOpsProcessor,
    applier: OperationApplier,
    compactor: Compactor,
    rejected: RejectedOpsHandler,
}

impl SyncEngine {
    /// Creates an engine with no schema migrations registered.
    pub fn new(ctx: SyncContext) -> Self {
        let migrator = Arc::new(SchemaMigrator::new(&ctx.config));
        Self::with_migrator(ctx, migrator)
    }

    /// Creates an engine with a migration registry.
    pub fn with_migrations(ctx: SyncContext, migrations: Vec<SchemaMigration>) -> SyncResult<Self> {
        let migrator = Arc::new(SchemaMigrator::with_migrations(&ctx.config, migrations)?);
        Ok(Self::with_migrator(ctx, migrator))
    }

    fn with_migrator(ctx: SyncContext, migrator: Arc<SchemaMigrator>) -> Self {
        Self {
            pipeline: RemoteOpsProcessor::new(ctx.clone(), Arc::clone(&migrator)),
            applier: OperationApplier::new(ctx.clone()),
            compactor: Compactor::new(ctx.clone()),
            rejected: RejectedOpsHandler::new(ctx.clone()),
            migrator,
            ctx,
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn client_id(&self) -> &ClientId {
        &self.ctx.client_id
    }

    pub fn pipeline(&self) -> &RemoteOpsProcessor {
        &self.pipeline
    }

    /// Whether this replica has no history at all: no snapshot and nothing
    /// ever appended.
    pub async fn is_fresh_client(&self) -> SyncResult<bool> {
        Ok(self.ctx.store.load_snapshot().await?.is_none() && self.ctx.store.last_seq().await? == 0)
    }

    // ── Startup ──────────────────────────────────────────────────

    /// Rebuilds domain state from the snapshot and the log tail, then
    /// recovers entries a crash left unapplied.
    pub async fn hydrate(&self) -> SyncResult<HydrationReport> {
        let mut report = HydrationReport::default();
        let store = &self.ctx.store;

        let snapshot = match store.load_snapshot().await? {
            Some(snapshot) => {
                let version = snapshot.schema_version;
                let snapshot = self.migrator.migrate_snapshot(snapshot)?;
                if snapshot.schema_version != version {
                    store.save_snapshot(&snapshot).await?;
                }
                self.ctx.domain.restore_state(&snapshot.state).await?;
                report.snapshot_restored = true;
                Some(snapshot)
            }
            None => None,
        };
        let after = snapshot.as_ref().map_or(0, |s| s.last_applied_seq);

        let tail: Vec<Operation> = store
            .get_ops_after_seq(after)
            .await?
            .into_iter()
            .filter(|e| {
                !e.is_rejected()
                    && !e.pending_apply
                    && e.application_status == ApplicationStatus::Applied
            })
            .map(|e| e.op)
            .collect();
        if !tail.is_empty() {
            let result = self.applier.apply(&tail, ApplyOptions::hydration()).await;
            report.replayed = result.applied_ops.len();
            if let Some(failed) = result.failed {
                error!("hydration stopped at {}: {}", failed.op.id, failed.error);
                self.ctx.checkpoint("hydration failure").await;
                return Err(failed.error);
            }
        }
        debug!("hydrated {} tail operations after seq {after}", report.replayed);

        report.recovered = self.recover_unapplied().await?;

        if snapshot.as_ref().is_some_and(|s| s.is_legacy_format()) {
            info!("snapshot predates entity keys, re-compacting");
            self.compactor.compact().await?;
        }
        Ok(report)
    }

    /// Re-applies entries left `pending_apply` by a crash and retries
    /// failed ones, on the standard path.
    async fn recover_unapplied(&self) -> SyncResult<usize> {
        let store = &self.ctx.store;
        let mut entries: BTreeMap<u64, OperationLogEntry> = BTreeMap::new();
        for entry in store.get_pending_apply().await? {
            entries.insert(entry.seq, entry);
        }
        for entry in store.get_by_status(ApplicationStatus::Failed).await? {
            if !entry.is_rejected() {
                entries.insert(entry.seq, entry);
            }
        }
        if entries.is_empty() {
            return Ok(0);
        }
        info!("recovering {} unapplied operations", entries.len());

        let seqs: BTreeMap<OpId, u64> = entries.values().map(|e| (e.op.id, e.seq)).collect();
        let ops = sort_by_dependency(entries.into_values().map(|e| e.op).collect());
        let result = self.applier.apply(&ops, ApplyOptions::default()).await;

        let applied: Vec<u64> = result
            .applied_ops
            .iter()
            .filter_map(|op| seqs.get(&op.id).copied())
            .collect();
        store.mark_applied(&applied).await?;
        self.ctx.clocks.merge_remote_clocks(&result.applied_ops).await?;
        if let Some(failed) = result.failed {
            warn!("recovery stopped at {}: {}", failed.op.id, failed.error);
            let remaining: Vec<OpId> = ops
                .iter()
                .map(|op| op.id)
                .skip_while(|id| *id != failed.op.id)
                .collect();
            store
                .mark_failed(&remaining, self.ctx.config.max_conflict_retry_attempts)
                .await?;
            self.ctx.checkpoint("crash recovery").await;
        }
        Ok(applied.len())
    }

    // ── Local capture ────────────────────────────────────────────

    /// Stamps a local change with the next clock, applies it and appends it
    /// for upload.
    pub async fn record_local_operation(&self, draft: OperationDraft) -> SyncResult<Operation> {
        let op = {
            let _lock = self.ctx.locks.acquire(LockName::OperationLog).await;
            let clock = self.ctx.clocks.next_local_clock(&self.ctx.client_id).await?;
            let op = draft.into_operation(
                self.ctx.client_id.clone(),
                clock,
                self.ctx.config.current_schema_version,
            );
            op.validate()?;
            self.append_and_apply_local(&op).await?;
            op
        };
        debug!("recorded {:?} on {:?}", op.op_type, op.entity_keys());
        self.maybe_compact().await;
        Ok(op)
    }

    /// Replaces the whole state with `state` and records a full-state
    /// operation that makes every other replica do the same.
    pub async fn import_full_state(
        &self,
        op_type: OpType,
        state: serde_json::Value,
    ) -> SyncResult<Operation> {
        if !op_type.is_full_state() {
            return Err(SyncError::apply(
                "full-state",
                format!("{op_type:?} is not a full-state operation"),
            ));
        }
        let _lock = self.ctx.locks.acquire(LockName::OperationLog).await;
        let clock = self.ctx.clocks.next_local_clock(&self.ctx.client_id).await?;
        let op = Operation::full_state(self.ctx.client_id.clone(), op_type, state, clock)
            .with_schema_version(self.ctx.config.current_schema_version);
        self.append_and_apply_local(&op).await?;
        info!("imported full state as {}", op.id);
        Ok(op)
    }

    async fn append_and_apply_local(&self, op: &Operation) -> SyncResult<()> {
        let seq = self.ctx.store.append(op, OpSource::Local, true).await?;
        if let Err(e) = self.ctx.domain.apply_operation(op).await {
            warn!("local operation {} could not be applied: {e}", op.id);
            self.ctx.store.mark_rejected(&[op.id]).await?;
            return Err(e);
        }
        self.ctx.store.mark_applied(&[seq]).await?;
        Ok(())
    }

    async fn maybe_compact(&self) {
        if self.compactor.note_local_op() {
            if let Err(e) = self.compactor.compact().await {
                warn!("automatic compaction failed: {e}");
            }
        }
    }

    pub async fn compact(&self) -> SyncResult<CompactionReport> {
        self.compactor.compact().await
    }

    pub async fn emergency_compact(&self) -> bool {
        self.compactor.emergency_compact().await
    }

    // ── Server exchange ──────────────────────────────────────────

    /// Uploads unsynced local operations.
    ///
    /// Piggybacked operations are processed before rejections are handled,
    /// and the last known server seq advances only after they are stored.
    pub async fn upload_pending_ops(&self, provider: &dyn SyncProvider) -> SyncResult<UploadOutcome> {
        let mut outcome = UploadOutcome::default();
        if self.is_fresh_client().await? {
            debug!("fresh client, nothing to upload");
            return Ok(outcome);
        }
        let _upload = self.ctx.locks.acquire(LockName::Upload).await;

        let pending: Vec<OperationLogEntry> = self
            .ctx
            .store
            .get_unsynced()
            .await?
            .into_iter()
            .filter(|e| !e.pending_apply)
            .collect();
        if pending.is_empty() {
            return Ok(outcome);
        }

        let mut rejections: Vec<RejectedOp> = Vec::new();
        for chunk in pending.chunks(self.ctx.config.upload_batch_size.max(1)) {
            let ops: Vec<Operation> = chunk.iter().map(|e| e.op.clone()).collect();
            let seqs: BTreeMap<OpId, u64> = chunk.iter().map(|e| (e.op.id, e.seq)).collect();
            let last_known = provider.get_last_server_seq().await?;
            let response = provider
                .upload_ops(&ops, &self.ctx.client_id, last_known)
                .await?;
            outcome.uploaded += ops.len();

            let accepted: Vec<u64> = response
                .results
                .iter()
                .filter(|r| r.accepted)
                .filter_map(|r| seqs.get(&r.op_id).copied())
                .collect();
            outcome.accepted += accepted.len();
            self.ctx.store.mark_synced(&accepted).await?;

            if !response.piggybacked_ops.is_empty() {
                let next_seq = if response.has_more_piggyback {
                    response
                        .piggybacked_ops
                        .iter()
                        .map(|s| s.server_seq)
                        .max()
                        .unwrap_or(last_known)
                } else {
                    response.latest_seq
                };
                let remote = response.piggybacked_ops.into_iter().map(|s| s.op).collect();
                let processed = self.pipeline.process_remote_ops(remote).await?;
                outcome.piggybacked_applied += processed.applied;
                outcome.new_local_ops += processed.local_win_ops_created;
                provider.set_last_server_seq(next_seq.max(last_known)).await?;
            } else if !response.has_more_piggyback && response.latest_seq > last_known {
                provider.set_last_server_seq(response.latest_seq).await?;
            }

            rejections.extend(response.results.iter().filter(|r| !r.accepted).map(RejectedOp::from));
        }

        if !rejections.is_empty() {
            outcome.rejected = rejections.len();
            let callback = Redownload {
                engine: self,
                provider,
            };
            let handled = self.rejected.handle_rejected_ops(&rejections, &callback).await?;
            outcome.new_local_ops += handled.merged_ops_created;
        }
        info!(
            "uploaded {} ops: {} accepted, {} rejected",
            outcome.uploaded, outcome.accepted, outcome.rejected
        );
        Ok(outcome)
    }

    /// Downloads operations after the last known server seq and runs them
    /// through the pipeline.
    ///
    /// A fresh client asks before downloading. With `force_from_seq0` every
    /// page from the start is fetched and all op clocks are returned. The
    /// last known server seq is persisted after each page is stored.
    pub async fn download_remote_ops(
        &self,
        provider: &dyn SyncProvider,
        force_from_seq0: bool,
    ) -> SyncResult<DownloadOutcome> {
        let mut outcome = DownloadOutcome::default();
        let stored_seq = provider.get_last_server_seq().await?;
        let mut since = if force_from_seq0 { 0 } else { stored_seq };
        let mut needs_confirmation = !force_from_seq0 && self.is_fresh_client().await?;
        let page_size = self.ctx.config.download_page_size.max(1);

        loop {
            let page = provider
                .download_ops(since, Some(&self.ctx.client_id), page_size)
                .await?;

            if needs_confirmation && !page.ops.is_empty() {
                needs_confirmation = false;
                let total = if page.has_more {
                    page.latest_seq.saturating_sub(since) as usize
                } else {
                    page.ops.len()
                };
                if !self.ctx.prompt.confirm_fresh_client_download(total).await {
                    info!("fresh-client download of {total} ops declined");
                    return Err(SyncError::Cancelled);
                }
            }

            let next_since = page
                .ops
                .iter()
                .map(|s| s.server_seq)
                .max()
                .unwrap_or(page.latest_seq)
                .max(since);
            if force_from_seq0 {
                outcome
                    .all_op_clocks
                    .extend(page.ops.iter().map(|s| s.op.vector_clock.clone()));
            }

            let ops: Vec<Operation> = page.ops.into_iter().map(|s| s.op).collect();
            let processed = self.pipeline.process_remote_ops(ops).await?;
            outcome.new_ops += processed.received;
            outcome.local_win_ops_created += processed.local_win_ops_created;

            if let Some(clock) = page.snapshot_vector_clock {
                self.ctx.clocks.merge_clock(&clock).await?;
                match &mut outcome.snapshot_vector_clock {
                    Some(merged) => merged.merge(&clock),
                    None => outcome.snapshot_vector_clock = Some(clock),
                }
            }

            if next_since > stored_seq {
                provider.set_last_server_seq(next_since).await?;
            }
            if !page.has_more || next_since == since {
                break;
            }
            since = next_since;
        }

        debug!("downloaded {} new ops", outcome.new_ops);
        Ok(outcome)
    }

    /// Uploads the whole state as a full-state operation.
    pub async fn upload_snapshot(
        &self,
        provider: &dyn SyncProvider,
        reason: SnapshotReason,
    ) -> SyncResult<u64> {
        let (state, clock) = {
            let _lock = self.ctx.locks.acquire(LockName::OperationLog).await;
            let clock = self.ctx.clocks.next_local_clock(&self.ctx.client_id).await?;
            (self.ctx.domain.full_state().await?, clock)
        };
        let seq = provider
            .upload_snapshot(
                state,
                &self.ctx.client_id,
                reason,
                &clock,
                self.ctx.config.current_schema_version,
            )
            .await?;
        info!("uploaded {reason:?} snapshot at server seq {seq}");
        Ok(seq)
    }

    /// Runs download and upload rounds until no new local operations are
    /// produced.
    ///
    /// More than `max_sync_rounds` rounds is a [`SyncError::SyncLoopDetected`].
    /// With `sync_timeout_ms` set, running out of time is a
    /// [`SyncError::Timeout`].
    pub async fn sync(&self, provider: &dyn SyncProvider) -> SyncResult<SyncReport> {
        match self.ctx.config.sync_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), self.sync_rounds(provider))
                .await
                .map_err(|_| SyncError::Timeout)?,
            None => self.sync_rounds(provider).await,
        }
    }

    async fn sync_rounds(&self, provider: &dyn SyncProvider) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        let max_rounds = self.ctx.config.max_sync_rounds.max(1);
        while report.rounds < max_rounds {
            report.rounds += 1;
            let downloaded = self.download_remote_ops(provider, false).await?;
            report.downloaded += downloaded.new_ops;
            let uploaded = self.upload_pending_ops(provider).await?;
            report.uploaded += uploaded.accepted;
            if uploaded.new_local_ops == 0 {
                debug!("sync settled after {} rounds", report.rounds);
                return Ok(report);
            }
        }
        error!("sync did not settle after {max_rounds} rounds");
        Err(SyncError::SyncLoopDetected { rounds: max_rounds })
    }
}

/// Download callback handed to the rejected-ops handler.
struct Redownload<'a> {
    engine: &'a SyncEngine,
    provider: &'a dyn SyncProvider,
}

#[async_trait]
impl<'a> DownloadCallback for Redownload<'a> {
    async fn download(&self, force_from_seq0: bool) -> SyncResult<DownloadOutcome> {
        self.engine
            .download_remote_ops(self.provider, force_from_seq0)
            .await
    }
}
