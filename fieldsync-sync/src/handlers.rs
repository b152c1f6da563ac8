//! Network-effect seam: the remote job API and per-operation dispatch.

use crate::error::SyncResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_types::{
    ChecklistUpdate, CompletionReport, FailurePolicy, Job, JobId, LocationFix, Message,
    Operation, OperationPayload, PhotoRef, RemoteJob, StartReport,
};
use std::fmt;
use tracing::debug;

/// Bearer credential used to authorize network calls.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Which photo set an upload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoStage {
    Before,
    After,
    Passes,
}

impl PhotoStage {
    pub fn as_str(self) -> &'static str {
        match self {
            PhotoStage::Before => "before",
            PhotoStage::After => "after",
            PhotoStage::Passes => "passes",
        }
    }
}

/// Server acknowledgement of a delivered operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteAck {
    /// The job's server version after the write, when the server reports it.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Remote job API. One method per operation type plus the lookup used for
/// the pre-sync conflict check.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Returns `None` when the server has no record of the job.
    async fn fetch_job(&self, job_id: &JobId, credential: &Credential)
    -> SyncResult<Option<RemoteJob>>;

    async fn start_job(
        &self,
        job: &Job,
        report: &StartReport,
        credential: &Credential,
    ) -> SyncResult<RemoteAck>;

    async fn submit_accuracy(
        &self,
        job: &Job,
        fix: &LocationFix,
        credential: &Credential,
    ) -> SyncResult<RemoteAck>;

    async fn upload_photo(
        &self,
        job: &Job,
        stage: PhotoStage,
        photo: &PhotoRef,
        credential: &Credential,
    ) -> SyncResult<RemoteAck>;

    async fn update_checklist(
        &self,
        job: &Job,
        update: &ChecklistUpdate,
        credential: &Credential,
    ) -> SyncResult<RemoteAck>;

    async fn complete_job(
        &self,
        job: &Job,
        report: &CompletionReport,
        credential: &Credential,
    ) -> SyncResult<RemoteAck>;

    async fn send_message(
        &self,
        job: &Job,
        message: &Message,
        credential: &Credential,
    ) -> SyncResult<RemoteAck>;
}

/// Result of handing one operation to the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub success: bool,
    pub error: Option<String>,
    /// False when the job's remaining operations must wait for the next pass.
    pub can_continue: bool,
    pub ack: RemoteAck,
}

/// Delivers one operation through the matching [`JobApi`] method.
///
/// `can_continue` comes from the operation type's failure policy, narrowed
/// further when the server rejected the job itself.
pub async fn dispatch(
    api: &dyn JobApi,
    job: &Job,
    op: &Operation,
    credential: &Credential,
) -> HandlerOutcome {
    debug!("[SYNC] dispatching {} {} for job {}", op.op_type(), op.id, job.id);
    let result = match &op.payload {
        OperationPayload::Start(report) => api.start_job(job, report, credential).await,
        OperationPayload::Accuracy(fix) => api.submit_accuracy(job, fix, credential).await,
        OperationPayload::BeforePhoto(photo) => {
            api.upload_photo(job, PhotoStage::Before, photo, credential).await
        }
        OperationPayload::Checklist(update) => {
            api.update_checklist(job, update, credential).await
        }
        OperationPayload::AfterPhoto(photo) => {
            api.upload_photo(job, PhotoStage::After, photo, credential).await
        }
        OperationPayload::PassesPhoto(photo) => {
            api.upload_photo(job, PhotoStage::Passes, photo, credential).await
        }
        OperationPayload::Complete(report) => api.complete_job(job, report, credential).await,
        OperationPayload::Message(message) => api.send_message(job, message, credential).await,
    };

    match result {
        Ok(ack) => HandlerOutcome {
            success: true,
            error: None,
            can_continue: true,
            ack,
        },
        Err(e) => HandlerOutcome {
            success: false,
            can_continue: op.op_type().failure_policy() == FailurePolicy::Continue
                && !e.halts_job(),
            error: Some(e.to_string()),
            ack: RemoteAck::default(),
        },
    }
}
