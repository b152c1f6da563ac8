//! Local and remote views of a job.

use crate::{JobId, ParseLabelError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a job, used for both the local and the remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Scheduled => "scheduled",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobStatus::Scheduled),
            "in_progress" => Ok(JobStatus::InProgress),
            "completed" => Ok(JobStatus::Completed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(ParseLabelError::new("job status", other)),
        }
    }
}

/// Locally held job record. The sync engine reads it and only ever writes
/// back the sync bookkeeping fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Worker assigned on this device.
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Last server version this device has observed or written.
    pub server_updated_at: Option<DateTime<Utc>>,
    /// True while the job has undelivered operations.
    pub requires_sync: bool,
    /// True once a terminal state was reached locally.
    pub locked: bool,
    /// Set when the server copy must replace the local one on next preload.
    pub needs_refresh: bool,
}

impl Job {
    pub fn new(id: JobId) -> Self {
        Self {
            id,
            status: JobStatus::Scheduled,
            worker_id: None,
            started_at: None,
            updated_at: Utc::now(),
            server_updated_at: None,
            requires_sync: false,
            locked: false,
            needs_refresh: false,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn started(mut self, at: DateTime<Utc>) -> Self {
        self.status = JobStatus::InProgress;
        self.started_at = Some(at);
        self.updated_at = at;
        self
    }
}

/// The server's copy of a job as returned by a remote lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJob {
    pub id: JobId,
    pub status: JobStatus,
    /// Worker currently running the job on the server side, if any.
    #[serde(default)]
    pub active_worker: Option<String>,
    #[serde(default)]
    pub cancelled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
