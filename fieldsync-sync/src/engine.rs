//! Sync engine: delivers queued operations to the server.
//!
//! One pass loads every pending or retry-eligible operation, groups it by
//! job, orders each group by sequence number, gates each job on a
//! pre-flight conflict check, then dispatches the operations one at a time.
//! Passes are single-flight: a concurrent call returns `already_syncing`
//! without touching the queue.
//!
//! Store access goes through `spawn_blocking`, so every read or write is a
//! suspension point. Nothing else yields.

use crate::config::EngineConfig;
use crate::connectivity::NetworkProbe;
use crate::error::{SyncError, SyncResult};
use crate::flight::SingleFlight;
use crate::handlers::{Credential, JobApi, dispatch};
use crate::listeners::{Listeners, Subscription};
use crate::resolver::ConflictResolver;
use chrono::Utc;
use fieldsync_storage::{QueueCounts, StorageResult, SyncStore};
use fieldsync_types::{
    Conflict, ConflictId, ConflictType, Job, JobId, Operation, OperationId, OperationPayload,
    OperationType, RemoteJob, Resolution,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, error, info, warn};

/// Why a sync request did nothing. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadySyncing,
    Offline,
    NoAuth,
    Cooldown,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::AlreadySyncing => "already_syncing",
            SkipReason::Offline => "offline",
            SkipReason::NoAuth => "no_auth",
            SkipReason::Cooldown => "cooldown",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure inside a pass, attributed to a job and, when the failure came
/// from delivering one, an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationError {
    pub job_id: JobId,
    pub operation_id: Option<OperationId>,
    pub op_type: Option<OperationType>,
    pub message: String,
}

/// Result of [`SyncEngine::start_sync`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub synced: usize,
    pub errors: Vec<OperationError>,
    /// Set when the pass was skipped.
    pub reason: Option<SkipReason>,
    /// Set when the pass itself aborted.
    pub error: Option<String>,
}

impl SyncOutcome {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            reason: Some(reason),
            ..Self::default()
        }
    }

    fn aborted(error: &SyncError) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.reason.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CurrentOperation {
    pub job_id: JobId,
    pub operation_id: OperationId,
    pub op_type: OperationType,
}

/// Progress snapshot broadcast to subscribers on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SyncProgress {
    pub status: SyncStatus,
    pub total_operations: usize,
    pub completed_operations: usize,
    pub current_operation: Option<CurrentOperation>,
    pub errors: Vec<OperationError>,
}

/// Groups operations by job and orders each group by sequence number, then
/// creation time.
pub fn order_for_delivery(ops: Vec<Operation>) -> BTreeMap<JobId, Vec<Operation>> {
    let mut groups: BTreeMap<JobId, Vec<Operation>> = BTreeMap::new();
    for op in ops {
        groups.entry(op.job_id).or_default().push(op);
    }
    for group in groups.values_mut() {
        group.sort_by_key(|op| (op.sequence(), op.created_at, op.id));
    }
    groups
}

enum Gate {
    Proceed,
    Blocked,
    Failed(OperationError),
}

#[derive(Default)]
struct PassReport {
    synced: usize,
    errors: Vec<OperationError>,
}

pub struct SyncEngine {
    store: SyncStore,
    api: Arc<dyn JobApi>,
    network: Arc<dyn NetworkProbe>,
    config: EngineConfig,
    credential: RwLock<Option<Credential>>,
    flight: SingleFlight,
    initialized: AtomicBool,
    progress: Mutex<SyncProgress>,
    listeners: Listeners<SyncProgress>,
}

impl SyncEngine {
    pub fn new(
        store: SyncStore,
        api: Arc<dyn JobApi>,
        network: Arc<dyn NetworkProbe>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            api,
            network,
            config,
            credential: RwLock::new(None),
            flight: SingleFlight::default(),
            initialized: AtomicBool::new(false),
            progress: Mutex::new(SyncProgress::default()),
            listeners: Listeners::new("SYNC"),
        }
    }

    /// Resets operations left `in_progress` by a previous process to
    /// `pending`, keeping their attempt counts. Runs once; returns how many
    /// operations were recovered.
    pub async fn initialize(&self) -> SyncResult<usize> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(0);
        }
        // In-progress rows belong to a live pass while one is running.
        let Some(_guard) = self.flight.try_begin() else {
            debug!("[SYNC] initialize deferred, a sync is in flight");
            return Ok(0);
        };
        if self.initialized.load(Ordering::Acquire) {
            return Ok(0);
        }

        let recovered = self.with_store(|s| s.recover_in_progress()).await?;
        self.initialized.store(true, Ordering::Release);
        if recovered > 0 {
            info!("[SYNC] recovered {} operation(s) interrupted mid-sync", recovered);
        }
        Ok(recovered)
    }

    pub fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.write().unwrap_or_else(PoisonError::into_inner) = credential;
    }

    pub fn has_credential(&self) -> bool {
        self.credential().is_some()
    }

    fn credential(&self) -> Option<Credential> {
        self.credential
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.flight.is_active()
    }

    pub fn progress(&self) -> SyncProgress {
        self.lock_progress().clone()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&SyncProgress) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    // ── Queue introspection ──

    pub async fn has_pending_operations(&self) -> SyncResult<bool> {
        Ok(self.pending_count().await? > 0)
    }

    /// Operations a pass would pick up right now.
    pub async fn pending_count(&self) -> SyncResult<usize> {
        let max = self.config.max_operation_attempts;
        self.with_store(move |s| s.count_sync_candidates(max)).await
    }

    pub async fn pending_summary(&self) -> SyncResult<QueueCounts> {
        self.with_store(|s| s.queue_counts()).await
    }

    // ── Local mutations ──

    /// Queues a local user action. This is the only path to the network,
    /// whether or not the device is currently online.
    pub async fn queue_operation(
        &self,
        job_id: JobId,
        payload: OperationPayload,
    ) -> SyncResult<Operation> {
        self.with_store(move |s| s.enqueue(&job_id, payload)).await
    }

    /// Settles a conflict left for review and applies the resolution.
    pub async fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        resolution: Resolution,
    ) -> SyncResult<usize> {
        self.with_store(move |s| s.settle_conflict(&conflict_id, resolution))
            .await
    }

    pub async fn unresolved_conflicts(&self) -> SyncResult<Vec<Conflict>> {
        self.with_store(|s| s.unresolved_conflicts()).await
    }

    pub async fn conflicts_for_job(&self, job_id: JobId) -> SyncResult<Vec<Conflict>> {
        self.with_store(move |s| s.conflicts_for_job(&job_id)).await
    }

    /// Deletes delivered operations of fully synced jobs older than the
    /// configured retention.
    pub async fn purge_synced(&self) -> SyncResult<usize> {
        let cutoff = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age));
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };
        let removed = self.with_store(move |s| s.purge_completed(cutoff)).await?;
        if removed > 0 {
            info!("[SYNC] retention sweep removed {} operation(s)", removed);
        }
        Ok(removed)
    }

    /// Puts failed operations that are still retry-eligible back to pending,
    /// then runs a pass.
    pub async fn retry_failed(&self) -> SyncOutcome {
        let max = self.config.max_operation_attempts;
        match self.with_store(move |s| s.reset_failed(max)).await {
            Ok(reset) => debug!("[SYNC] reset {} failed operation(s) for retry", reset),
            Err(e) => {
                error!("[SYNC] could not reset failed operations: {}", e);
                return SyncOutcome::aborted(&e);
            }
        }
        self.start_sync().await
    }

    // ── Sync pass ──

    /// Runs one sync pass.
    ///
    /// Skips, in order, when a pass is already running, when offline, and
    /// when no credential is set. Per-operation failures are collected in
    /// `errors`; only a store failure aborts the pass.
    pub async fn start_sync(&self) -> SyncOutcome {
        self.start_sync_with(|| {}).await
    }

    /// Runs one sync pass, calling `on_start` once this pass owns the
    /// single-flight guard. A pass skipped as already syncing never calls it.
    pub(crate) async fn start_sync_with(&self, on_start: impl FnOnce() + Send) -> SyncOutcome {
        let Some(_guard) = self.flight.try_begin() else {
            debug!("[SYNC] start_sync skipped: already syncing");
            return SyncOutcome::skipped(SkipReason::AlreadySyncing);
        };
        on_start();
        if !self.network.is_online() {
            debug!("[SYNC] start_sync skipped: offline");
            return SyncOutcome::skipped(SkipReason::Offline);
        }
        let Some(credential) = self.credential() else {
            debug!("[SYNC] start_sync skipped: no credential");
            return SyncOutcome::skipped(SkipReason::NoAuth);
        };

        self.update_progress(|p| {
            *p = SyncProgress {
                status: SyncStatus::Syncing,
                ..SyncProgress::default()
            };
        });

        match self.run_pass(&credential).await {
            Ok(report) => {
                let success = report.errors.is_empty();
                self.update_progress(|p| {
                    p.status = if success {
                        SyncStatus::Completed
                    } else {
                        SyncStatus::Error
                    };
                    p.current_operation = None;
                });
                info!(
                    "[SYNC] pass finished: {} synced, {} error(s)",
                    report.synced,
                    report.errors.len()
                );
                SyncOutcome {
                    success,
                    synced: report.synced,
                    errors: report.errors,
                    ..SyncOutcome::default()
                }
            }
            Err(e) => {
                error!("[SYNC] pass aborted: {}", e);
                self.update_progress(|p| {
                    p.status = SyncStatus::Error;
                    p.current_operation = None;
                });
                SyncOutcome::aborted(&e)
            }
        }
    }

    async fn run_pass(&self, credential: &Credential) -> SyncResult<PassReport> {
        // Under the flight guard no other pass owns in-progress rows, so any
        // left behind by an aborted pass go back to pending.
        let recovered = self.with_store(|s| s.recover_in_progress()).await?;
        if recovered > 0 {
            warn!("[SYNC] recovered {} operation(s) stranded by an earlier pass", recovered);
        }

        let max = self.config.max_operation_attempts;
        let (candidates, halts) = self
            .with_store(move |s| Ok((s.sync_candidates(max)?, s.exhausted_halts(max)?)))
            .await?;
        if candidates.is_empty() {
            debug!("[SYNC] nothing to sync");
            self.finalize_jobs().await?;
            return Ok(PassReport::default());
        }

        let mut report = PassReport::default();
        let mut groups = order_for_delivery(candidates);
        for (job_id, blocker) in &halts {
            if let Some(ops) = groups.get_mut(job_id) {
                self.hold_behind(blocker, ops, &mut report);
            }
        }
        groups.retain(|_, ops| !ops.is_empty());

        let total: usize = groups.values().map(Vec::len).sum();
        info!("[SYNC] syncing {} operation(s) across {} job(s)", total, groups.len());
        self.update_progress(|p| p.total_operations = total);

        for (job_id, ops) in groups {
            let Some(mut job) = self.with_store(move |s| s.get_job(&job_id)).await? else {
                warn!("[SYNC] job {} not found locally, skipping {} operation(s)", job_id, ops.len());
                continue;
            };

            match self.gate_job(&mut job, credential).await? {
                Gate::Proceed => {}
                Gate::Blocked => continue,
                Gate::Failed(err) => {
                    self.record_error(&mut report, err);
                    continue;
                }
            }

            self.deliver_job(&mut job, ops, credential, &mut report).await?;
        }

        self.finalize_jobs().await?;
        Ok(report)
    }

    /// Removes from `ops` everything queued after an exhausted operation
    /// that halts its job, reporting each held operation as an error.
    fn hold_behind(&self, blocker: &Operation, ops: &mut Vec<Operation>, report: &mut PassReport) {
        let blocked_at = (blocker.sequence(), blocker.created_at);
        let (held, deliverable): (Vec<_>, Vec<_>) = ops
            .drain(..)
            .partition(|op| (op.sequence(), op.created_at) > blocked_at);
        *ops = deliverable;
        if held.is_empty() {
            return;
        }

        warn!(
            "[SYNC] job {} is held: {} {} used up its attempts, {} operation(s) wait",
            blocker.job_id,
            blocker.op_type(),
            blocker.id,
            held.len()
        );
        let message = format!("held: {} {} used up its attempts", blocker.op_type(), blocker.id);
        for op in held {
            self.record_error(
                report,
                OperationError {
                    job_id: op.job_id,
                    operation_id: Some(op.id),
                    op_type: Some(op.op_type()),
                    message: message.clone(),
                },
            );
        }
    }

    /// Clears `requires_sync` on every flagged job with nothing left to deliver.
    async fn finalize_jobs(&self) -> SyncResult<()> {
        let cleared = self
            .with_store(|s| {
                let flagged: Vec<JobId> = s.jobs_requiring_sync()?.iter().map(|j| j.id).collect();
                s.finalize_synced_jobs(&flagged)
            })
            .await?;
        if !cleared.is_empty() {
            debug!("[SYNC] {} job(s) fully synced", cleared.len());
        }
        Ok(())
    }

    /// Pre-flight conflict check against the server copy of the job.
    async fn gate_job(&self, job: &mut Job, credential: &Credential) -> SyncResult<Gate> {
        let job_id = job.id;
        if self
            .with_store(move |s| s.has_unresolved_conflict(&job_id))
            .await?
        {
            info!("[SYNC] job {} has an unresolved conflict, skipping", job_id);
            return Ok(Gate::Blocked);
        }

        let remote = match self.api.fetch_job(&job_id, credential).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!("[SYNC] conflict check for job {} failed: {}", job_id, e);
                return Ok(Gate::Failed(OperationError {
                    job_id,
                    operation_id: None,
                    op_type: None,
                    message: format!("conflict check failed: {e}"),
                }));
            }
        };

        let Some(detected) = ConflictResolver::detect(job, remote.as_ref()) else {
            return Ok(Gate::Proceed);
        };

        let server_snapshot = remote
            .as_ref()
            .map_or(serde_json::Value::Null, |r| ConflictResolver::snapshot(r));
        if self
            .already_settled(job_id, detected.conflict_type, &server_snapshot)
            .await?
        {
            debug!(
                "[SYNC] {} on job {} already settled for this server version",
                detected.conflict_type, job_id
            );
            self.observe_server_version(job, remote.as_ref()).await?;
            return Ok(Gate::Proceed);
        }

        let resolution = if self.config.manual_review.contains(&detected.conflict_type) {
            None
        } else {
            Some(ConflictResolver::resolve(
                detected.conflict_type,
                job,
                remote.as_ref(),
            ))
        };
        let conflict = Conflict::new(
            job_id,
            detected.conflict_type,
            ConflictResolver::snapshot(&*job),
            server_snapshot,
        )
        .with_reason(detected.reason.clone());

        info!(
            "[SYNC] {} conflict on job {} ({}): {}",
            detected.conflict_type,
            job_id,
            detected.reason,
            resolution.map_or("left for review", Resolution::as_str)
        );
        self.with_store(move |s| s.record_conflict(&conflict, resolution))
            .await?;

        if ConflictResolver::allows_sync(resolution) {
            self.observe_server_version(job, remote.as_ref()).await?;
            Ok(Gate::Proceed)
        } else {
            Ok(Gate::Blocked)
        }
    }

    /// True when the latest conflict on the job is the same detection, already
    /// settled in a way that lets the job sync.
    async fn already_settled(
        &self,
        job_id: JobId,
        conflict_type: ConflictType,
        server_snapshot: &serde_json::Value,
    ) -> SyncResult<bool> {
        let history = self.with_store(move |s| s.conflicts_for_job(&job_id)).await?;
        Ok(history.last().is_some_and(|last| {
            last.conflict_type == conflict_type
                && &last.server_snapshot == server_snapshot
                && ConflictResolver::allows_sync(last.resolution)
        }))
    }

    async fn observe_server_version(
        &self,
        job: &mut Job,
        remote: Option<&RemoteJob>,
    ) -> SyncResult<()> {
        let Some(at) = remote.map(|r| r.updated_at) else {
            return Ok(());
        };
        let job_id = job.id;
        self.with_store(move |s| s.record_server_version(&job_id, at))
            .await?;
        job.server_updated_at = Some(at);
        Ok(())
    }

    /// Delivers one job's operations in order. Stops early when a failure
    /// may not be followed by the rest of the job.
    async fn deliver_job(
        &self,
        job: &mut Job,
        ops: Vec<Operation>,
        credential: &Credential,
        report: &mut PassReport,
    ) -> SyncResult<()> {
        for op in ops {
            let op_id = op.id;
            let op_type = op.op_type();
            self.update_progress(|p| {
                p.current_operation = Some(CurrentOperation {
                    job_id: job.id,
                    operation_id: op_id,
                    op_type,
                });
            });

            self.with_store(move |s| s.mark_in_progress(&op_id)).await?;
            let outcome = dispatch(self.api.as_ref(), job, &op, credential).await;

            if outcome.success {
                self.with_store(move |s| s.mark_completed(&op_id)).await?;
                if let Some(at) = outcome.ack.updated_at {
                    let job_id = job.id;
                    self.with_store(move |s| s.record_server_version(&job_id, at))
                        .await?;
                    job.server_updated_at = Some(at);
                }
                report.synced += 1;
                self.update_progress(|p| p.completed_operations += 1);
                continue;
            }

            let message = outcome
                .error
                .unwrap_or_else(|| "operation failed".to_string());
            let failure = message.clone();
            let attempts = self
                .with_store(move |s| s.mark_failed(&op_id, &failure))
                .await?;
            warn!(
                "[SYNC] {} {} for job {} failed (attempt {}/{}): {}",
                op_type, op_id, job.id, attempts, self.config.max_operation_attempts, message
            );
            self.record_error(
                report,
                OperationError {
                    job_id: job.id,
                    operation_id: Some(op_id),
                    op_type: Some(op_type),
                    message,
                },
            );

            if !outcome.can_continue {
                info!(
                    "[SYNC] {} failure halts job {} for this pass",
                    op_type, job.id
                );
                break;
            }
        }
        Ok(())
    }

    fn record_error(&self, report: &mut PassReport, err: OperationError) {
        self.update_progress(|p| p.errors.push(err.clone()));
        report.errors.push(err);
    }

    fn lock_progress(&self) -> std::sync::MutexGuard<'_, SyncProgress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update_progress(&self, change: impl FnOnce(&mut SyncProgress)) {
        let snapshot = {
            let mut progress = self.lock_progress();
            change(&mut progress);
            progress.clone()
        };
        self.listeners.notify(&snapshot);
    }

    async fn with_store<T, F>(&self, f: F) -> SyncResult<T>
    where
        F: FnOnce(&SyncStore) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("syncing", &self.is_syncing())
            .finish_non_exhaustive()
    }
}
