//! Conflict classification and rule-based resolution.
//!
//! Pure functions over the local job record and the server's copy; the
//! engine persists whatever they decide.

use fieldsync_types::{ConflictType, Job, JobStatus, RemoteJob, Resolution};
use serde::Serialize;

/// A mismatch found by [`ConflictResolver::detect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedConflict {
    pub conflict_type: ConflictType,
    pub reason: String,
}

impl DetectedConflict {
    fn new(conflict_type: ConflictType, reason: impl Into<String>) -> Self {
        Self {
            conflict_type,
            reason: reason.into(),
        }
    }
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Classifies the difference between the local job and the server copy.
    /// `None` means the job can sync as is.
    pub fn detect(local: &Job, remote: Option<&RemoteJob>) -> Option<DetectedConflict> {
        let Some(remote) = remote else {
            return Some(DetectedConflict::new(
                ConflictType::Cancellation,
                "not found remotely",
            ));
        };

        if remote.status == JobStatus::Cancelled {
            if started_before_cancellation(local, remote) {
                return None;
            }
            return Some(DetectedConflict::new(
                ConflictType::Cancellation,
                "cancelled remotely",
            ));
        }

        if remote.status == JobStatus::InProgress
            && local.status == JobStatus::InProgress
            && other_worker_active(local, remote)
        {
            return Some(DetectedConflict::new(
                ConflictType::MultiCleaner,
                format!(
                    "also in progress by {}",
                    remote.active_worker.as_deref().unwrap_or("another worker")
                ),
            ));
        }

        match local.server_updated_at {
            Some(seen) if remote.updated_at > seen => Some(DetectedConflict::new(
                ConflictType::DataMismatch,
                format!("server copy changed at {}", remote.updated_at),
            )),
            _ => None,
        }
    }

    /// Deterministic resolution for a conflict of the given type.
    pub fn resolve(
        conflict_type: ConflictType,
        local: &Job,
        remote: Option<&RemoteJob>,
    ) -> Resolution {
        match conflict_type {
            ConflictType::Cancellation => match remote {
                Some(remote) if started_before_cancellation(local, remote) => {
                    Resolution::LocalWins
                }
                _ => Resolution::ServerWins,
            },
            ConflictType::MultiCleaner => Resolution::Merged,
            ConflictType::DataMismatch => match remote {
                Some(remote) if remote.updated_at > local.updated_at => Resolution::ServerWins,
                _ => Resolution::LocalWins,
            },
        }
    }

    /// Whether a job may keep syncing after this outcome. Unresolved
    /// conflicts wait for manual review.
    pub fn allows_sync(resolution: Option<Resolution>) -> bool {
        matches!(resolution, Some(Resolution::LocalWins | Resolution::Merged))
    }

    /// JSON snapshot of a record for the conflict log.
    pub fn snapshot<T: Serialize>(value: &T) -> serde_json::Value {
        serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
    }
}

fn started_before_cancellation(local: &Job, remote: &RemoteJob) -> bool {
    matches!(
        (local.started_at, remote.cancelled_at),
        (Some(started), Some(cancelled)) if started < cancelled
    )
}

fn other_worker_active(local: &Job, remote: &RemoteJob) -> bool {
    match (&local.worker_id, &remote.active_worker) {
        (Some(mine), Some(theirs)) => mine != theirs,
        (None, Some(_)) => true,
        _ => false,
    }
}
