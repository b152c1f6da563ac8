//! Shared mocks and fixtures for the sync integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_storage::SyncStore;
use fieldsync_sync::{
    ConnectivityTransport, Credential, EngineConfig, JobApi, NetworkProbe, NetworkState,
    RemoteAck, SyncEngine, SyncError, SyncResult,
};
use fieldsync_types::{
    ChecklistUpdate, CompletionReport, Job, JobId, JobStatus, LocationFix, Message,
    OperationPayload, OperationType, PhotoRef, RemoteJob, StartReport,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, mpsc};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Mock JobApi ─────────────────────────────────────────────────

/// One call seen by the mock. `op_type` is `None` for the conflict lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiCall {
    pub job_id: JobId,
    pub op_type: Option<OperationType>,
}

enum Script {
    Fail { remaining: usize },
    Reject,
}

#[derive(Default)]
pub struct MockJobApi {
    calls: Mutex<Vec<ApiCall>>,
    /// Server copies by job. Unlisted jobs get a quiet scheduled record.
    remote: Mutex<HashMap<JobId, Option<RemoteJob>>>,
    scripts: Mutex<HashMap<OperationType, Script>>,
    fetch_error: AtomicBool,
    ack_at: Mutex<Option<DateTime<Utc>>>,
    gated: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl MockJobApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Delivery calls only, without conflict lookups.
    pub fn deliveries(&self) -> Vec<(JobId, OperationType)> {
        self.calls()
            .into_iter()
            .filter_map(|c| c.op_type.map(|t| (c.job_id, t)))
            .collect()
    }

    pub fn delivered_types(&self, job_id: JobId) -> Vec<OperationType> {
        self.deliveries()
            .into_iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, t)| t)
            .collect()
    }

    pub fn set_remote(&self, job_id: JobId, remote: Option<RemoteJob>) {
        self.remote.lock().unwrap().insert(job_id, remote);
    }

    /// The next `times` deliveries of `op_type` fail with a network error.
    pub fn fail(&self, op_type: OperationType, times: usize) {
        self.scripts
            .lock()
            .unwrap()
            .insert(op_type, Script::Fail { remaining: times });
    }

    pub fn fail_always(&self, op_type: OperationType) {
        self.fail(op_type, usize::MAX);
    }

    /// Every delivery of `op_type` is rejected outright by the server.
    pub fn reject(&self, op_type: OperationType) {
        self.scripts.lock().unwrap().insert(op_type, Script::Reject);
    }

    pub fn clear_failures(&self) {
        self.scripts.lock().unwrap().clear();
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fetch_error.store(fail, Ordering::SeqCst);
    }

    pub fn ack_with(&self, at: DateTime<Utc>) {
        *self.ack_at.lock().unwrap() = Some(at);
    }

    /// Deliveries block until `release` is notified, after signalling
    /// `entered`.
    pub fn hold_deliveries(&self, hold: bool) {
        self.gated.store(hold, Ordering::SeqCst);
    }

    fn scripted_failure(&self, op_type: OperationType) -> Option<SyncError> {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(&op_type)? {
            Script::Reject => Some(SyncError::Rejected(format!("{op_type} refused"))),
            Script::Fail { remaining } if *remaining > 0 => {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                Some(SyncError::Network(format!("{op_type} timed out")))
            }
            Script::Fail { .. } => None,
        }
    }

    async fn deliver(&self, job: &Job, op_type: OperationType) -> SyncResult<RemoteAck> {
        self.calls.lock().unwrap().push(ApiCall {
            job_id: job.id,
            op_type: Some(op_type),
        });
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if let Some(err) = self.scripted_failure(op_type) {
            return Err(err);
        }
        Ok(RemoteAck {
            updated_at: *self.ack_at.lock().unwrap(),
        })
    }
}

#[async_trait]
impl JobApi for MockJobApi {
    async fn fetch_job(
        &self,
        job_id: &JobId,
        _credential: &Credential,
    ) -> SyncResult<Option<RemoteJob>> {
        self.calls.lock().unwrap().push(ApiCall {
            job_id: *job_id,
            op_type: None,
        });
        if self.fetch_error.load(Ordering::SeqCst) {
            return Err(SyncError::Network("lookup timed out".into()));
        }
        let remote = self.remote.lock().unwrap().get(job_id).cloned();
        Ok(remote.unwrap_or_else(|| Some(quiet_remote(*job_id))))
    }

    async fn start_job(
        &self,
        job: &Job,
        _report: &StartReport,
        _credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        self.deliver(job, OperationType::Start).await
    }

    async fn submit_accuracy(
        &self,
        job: &Job,
        _fix: &LocationFix,
        _credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        self.deliver(job, OperationType::Accuracy).await
    }

    async fn upload_photo(
        &self,
        job: &Job,
        stage: fieldsync_sync::PhotoStage,
        _photo: &PhotoRef,
        _credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        let op_type = match stage {
            fieldsync_sync::PhotoStage::Before => OperationType::BeforePhoto,
            fieldsync_sync::PhotoStage::After => OperationType::AfterPhoto,
            fieldsync_sync::PhotoStage::Passes => OperationType::PassesPhoto,
        };
        self.deliver(job, op_type).await
    }

    async fn update_checklist(
        &self,
        job: &Job,
        _update: &ChecklistUpdate,
        _credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        self.deliver(job, OperationType::Checklist).await
    }

    async fn complete_job(
        &self,
        job: &Job,
        _report: &CompletionReport,
        _credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        self.deliver(job, OperationType::Complete).await
    }

    async fn send_message(
        &self,
        job: &Job,
        _message: &Message,
        _credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        self.deliver(job, OperationType::Message).await
    }
}

/// A scheduled server record that never conflicts.
pub fn quiet_remote(job_id: JobId) -> RemoteJob {
    RemoteJob {
        id: job_id,
        status: JobStatus::Scheduled,
        active_worker: None,
        cancelled_at: None,
        updated_at: DateTime::<Utc>::UNIX_EPOCH,
    }
}

// ── Network doubles ─────────────────────────────────────────────

pub struct FlagProbe(AtomicBool);

impl FlagProbe {
    pub fn online() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(true)))
    }

    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl NetworkProbe for FlagProbe {
    fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct MockTransport {
    current: Mutex<NetworkState>,
    fetch_fails: AtomicBool,
    fetches: Mutex<usize>,
    events: mpsc::Sender<NetworkState>,
    receiver: Mutex<Option<mpsc::Receiver<NetworkState>>>,
}

impl MockTransport {
    pub fn new(initial: NetworkState) -> Arc<Self> {
        let (events, receiver) = mpsc::channel(32);
        Arc::new(Self {
            current: Mutex::new(initial),
            fetch_fails: AtomicBool::new(false),
            fetches: Mutex::new(0),
            events,
            receiver: Mutex::new(Some(receiver)),
        })
    }

    pub fn set_current(&self, state: NetworkState) {
        *self.current.lock().unwrap() = state;
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fetch_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        *self.fetches.lock().unwrap()
    }

    /// Pushes a raw transport event, as the platform would.
    pub async fn emit(&self, state: NetworkState) {
        self.set_current(state);
        self.events.send(state).await.unwrap();
    }
}

#[async_trait]
impl ConnectivityTransport for MockTransport {
    async fn fetch(&self) -> SyncResult<NetworkState> {
        *self.fetches.lock().unwrap() += 1;
        if self.fetch_fails.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("netinfo unavailable".into()));
        }
        Ok(*self.current.lock().unwrap())
    }

    fn watch(&self) -> SyncResult<mpsc::Receiver<NetworkState>> {
        self.receiver
            .lock()
            .unwrap()
            .take()
            .ok_or(SyncError::ChannelClosed("transport events already watched"))
    }
}

// ── Fixtures ────────────────────────────────────────────────────

pub struct Harness {
    pub store: SyncStore,
    pub api: Arc<MockJobApi>,
    pub network: Arc<FlagProbe>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let store = SyncStore::open_in_memory().unwrap();
        Self::on_store(store, config)
    }

    pub fn on_store(store: SyncStore, config: EngineConfig) -> Self {
        let api = MockJobApi::new();
        let network = FlagProbe::online();
        let engine = Arc::new(SyncEngine::new(
            store.clone(),
            api.clone(),
            network.clone(),
            config,
        ));
        engine.set_credential(Some(Credential::new("test-token")));
        Self {
            store,
            api,
            network,
            engine,
        }
    }

    /// Stores a fresh scheduled job assigned to `ana`.
    pub fn job(&self) -> Job {
        let job = Job::new(JobId::new()).with_worker("ana");
        self.store.upsert_job(&job).unwrap();
        job
    }

    pub fn queue(&self, job: &Job, payload: OperationPayload) -> fieldsync_types::Operation {
        self.store.enqueue(&job.id, payload).unwrap()
    }
}

// ── Payloads ────────────────────────────────────────────────────

pub fn start() -> OperationPayload {
    OperationPayload::Start(StartReport {
        started_at: Utc::now(),
        worker_id: Some("ana".into()),
    })
}

pub fn accuracy() -> OperationPayload {
    OperationPayload::Accuracy(LocationFix {
        latitude: 52.37,
        longitude: 4.89,
        accuracy_m: 8.0,
        captured_at: Utc::now(),
    })
}

pub fn checklist(item: &str) -> OperationPayload {
    OperationPayload::Checklist(ChecklistUpdate {
        item_id: item.into(),
        completed: true,
        updated_at: Utc::now(),
    })
}

pub fn before_photo(room: &str) -> OperationPayload {
    OperationPayload::BeforePhoto(photo(room))
}

pub fn after_photo(room: &str) -> OperationPayload {
    OperationPayload::AfterPhoto(photo(room))
}

fn photo(room: &str) -> PhotoRef {
    PhotoRef {
        photo_id: format!("photo-{room}"),
        room_id: Some(room.into()),
        captured_at: Utc::now(),
    }
}

pub fn complete() -> OperationPayload {
    OperationPayload::Complete(CompletionReport {
        completed_at: Utc::now(),
        notes: None,
    })
}

pub fn message(body: &str) -> OperationPayload {
    OperationPayload::Message(Message {
        body: body.into(),
        sent_at: Utc::now(),
    })
}
