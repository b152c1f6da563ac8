//! HTTP client for the job API.
//!
//! Every call carries the caller's bearer credential. Write routes answer
//! with the job's new server version, which the sync engine records so its
//! own writes are not mistaken for remote edits on the next pass.

use crate::config::ApiConfig;
use crate::error::{CloudError, CloudResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldsync_sync::{Credential, JobApi, PhotoStage, RemoteAck, SyncResult};
use fieldsync_types::{
    ChecklistUpdate, CompletionReport, Job, JobId, LocationFix, Message, PhotoRef, RemoteJob,
    StartReport,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

#[derive(Deserialize)]
struct AckBody {
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// `reqwest` implementation of [`JobApi`].
pub struct JobApiClient {
    client: Client,
    config: ApiConfig,
}

impl JobApiClient {
    pub fn new(config: ApiConfig) -> CloudResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Looks a job up on the server; a 404 means the server has no record.
    pub async fn get_job(
        &self,
        job_id: &JobId,
        credential: &Credential,
    ) -> CloudResult<Option<RemoteJob>> {
        let path = format!("/api/jobs/{job_id}");
        debug!("GET {path}");
        let resp = self
            .client
            .get(self.url(&path))
            .bearer_auth(credential.token())
            .send()
            .await?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!("job {job_id} not found remotely");
            return Ok(None);
        }

        let body = check_status(resp).await?.text().await?;
        Ok(Some(serde_json::from_str(&body)?))
    }

    /// Posts one write to a job sub-route and returns the acknowledgement.
    pub async fn post_job(
        &self,
        job_id: &JobId,
        route: &str,
        body: &impl Serialize,
        credential: &Credential,
    ) -> CloudResult<RemoteAck> {
        let path = format!("/api/jobs/{job_id}/{route}");
        debug!("POST {path}");
        let resp = self
            .client
            .post(self.url(&path))
            .bearer_auth(credential.token())
            .json(body)
            .send()
            .await?;

        let text = check_status(resp).await?.text().await?;
        if text.trim().is_empty() {
            return Ok(RemoteAck::default());
        }
        let ack: AckBody = serde_json::from_str(&text)?;
        Ok(RemoteAck {
            updated_at: ack.updated_at,
        })
    }
}

/// Turns a non-success response into [`CloudError::Status`], preferring the
/// server's `{"error": ...}` message over the raw body.
async fn check_status(resp: reqwest::Response) -> CloudResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }

    let text = resp.text().await.unwrap_or_default();
    let message = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => body.error,
        Err(_) if text.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("unknown status")
            .to_string(),
        Err(_) => text,
    };
    Err(CloudError::Status {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl JobApi for JobApiClient {
    async fn fetch_job(
        &self,
        job_id: &JobId,
        credential: &Credential,
    ) -> SyncResult<Option<RemoteJob>> {
        Ok(self.get_job(job_id, credential).await?)
    }

    async fn start_job(
        &self,
        job: &Job,
        report: &StartReport,
        credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        Ok(self.post_job(&job.id, "start", report, credential).await?)
    }

    async fn submit_accuracy(
        &self,
        job: &Job,
        fix: &LocationFix,
        credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        Ok(self.post_job(&job.id, "accuracy", fix, credential).await?)
    }

    async fn upload_photo(
        &self,
        job: &Job,
        stage: PhotoStage,
        photo: &PhotoRef,
        credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        let route = format!("photos/{}", stage.as_str());
        Ok(self.post_job(&job.id, &route, photo, credential).await?)
    }

    async fn update_checklist(
        &self,
        job: &Job,
        update: &ChecklistUpdate,
        credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        Ok(self.post_job(&job.id, "checklist", update, credential).await?)
    }

    async fn complete_job(
        &self,
        job: &Job,
        report: &CompletionReport,
        credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        Ok(self.post_job(&job.id, "complete", report, credential).await?)
    }

    async fn send_message(
        &self,
        job: &Job,
        message: &Message,
        credential: &Credential,
    ) -> SyncResult<RemoteAck> {
        Ok(self.post_job(&job.id, "messages", message, credential).await?)
    }
}
