//! Queued operations and their typed payloads.

use crate::{JobId, OperationId, ParseLabelError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of deferred network effect. The discriminant is the sequence number
/// that orders operations within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OperationType {
    Start = 1,
    Accuracy = 2,
    BeforePhoto = 3,
    Checklist = 4,
    AfterPhoto = 5,
    PassesPhoto = 6,
    Complete = 7,
    Message = 8,
}

/// What happens to the rest of a job's operations when one of this type fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Later operations of the job wait for the next sync pass.
    HaltJob,
    /// Later operations of the job are still attempted.
    Continue,
}

impl OperationType {
    pub const ALL: [OperationType; 8] = [
        OperationType::Start,
        OperationType::Accuracy,
        OperationType::BeforePhoto,
        OperationType::Checklist,
        OperationType::AfterPhoto,
        OperationType::PassesPhoto,
        OperationType::Complete,
        OperationType::Message,
    ];

    pub fn sequence(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::Start => "start",
            OperationType::Accuracy => "accuracy",
            OperationType::BeforePhoto => "before_photo",
            OperationType::Checklist => "checklist",
            OperationType::AfterPhoto => "after_photo",
            OperationType::PassesPhoto => "passes_photo",
            OperationType::Complete => "complete",
            OperationType::Message => "message",
        }
    }

    /// Job-defining operations halt the job on failure; item-scoped ones
    /// (a single photo, checklist item or message) do not.
    pub fn failure_policy(self) -> FailurePolicy {
        match self {
            OperationType::Start | OperationType::Accuracy | OperationType::Complete => {
                FailurePolicy::HaltJob
            }
            OperationType::BeforePhoto
            | OperationType::Checklist
            | OperationType::AfterPhoto
            | OperationType::PassesPhoto
            | OperationType::Message => FailurePolicy::Continue,
        }
    }

    /// Messages may still be sent for a locked job; everything else mutates it.
    pub fn mutates_job(self) -> bool {
        self != OperationType::Message
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ParseLabelError::new("operation type", s))
    }
}

/// Delivery state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "in_progress" => Ok(OperationStatus::InProgress),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(ParseLabelError::new("operation status", other)),
        }
    }
}

// ── Payloads ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartReport {
    pub started_at: DateTime<Utc>,
    pub worker_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
    pub captured_at: DateTime<Utc>,
}

/// Reference to a photo held by the blob store. The bytes travel separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhotoRef {
    pub photo_id: String,
    pub room_id: Option<String>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistUpdate {
    pub item_id: String,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub completed_at: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// Payload of a queued operation, one variant per [`OperationType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationPayload {
    Start(StartReport),
    Accuracy(LocationFix),
    BeforePhoto(PhotoRef),
    Checklist(ChecklistUpdate),
    AfterPhoto(PhotoRef),
    PassesPhoto(PhotoRef),
    Complete(CompletionReport),
    Message(Message),
}

impl OperationPayload {
    pub fn op_type(&self) -> OperationType {
        match self {
            OperationPayload::Start(_) => OperationType::Start,
            OperationPayload::Accuracy(_) => OperationType::Accuracy,
            OperationPayload::BeforePhoto(_) => OperationType::BeforePhoto,
            OperationPayload::Checklist(_) => OperationType::Checklist,
            OperationPayload::AfterPhoto(_) => OperationType::AfterPhoto,
            OperationPayload::PassesPhoto(_) => OperationType::PassesPhoto,
            OperationPayload::Complete(_) => OperationType::Complete,
            OperationPayload::Message(_) => OperationType::Message,
        }
    }
}

// ── Operation ───────────────────────────────────────────────────

/// One deferred network effect tied to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub job_id: JobId,
    pub payload: OperationPayload,
    pub status: OperationStatus,
    /// Failed delivery attempts. Never bumped by crash recovery.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(job_id: JobId, payload: OperationPayload) -> Self {
        let now = Utc::now();
        Self {
            id: OperationId::new(),
            job_id,
            payload,
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn op_type(&self) -> OperationType {
        self.payload.op_type()
    }

    pub fn sequence(&self) -> u8 {
        self.op_type().sequence()
    }

    /// A failed operation that has not used up its attempts.
    pub fn is_retry_eligible(&self, max_attempts: u32) -> bool {
        self.status == OperationStatus::Failed && self.attempts < max_attempts
    }

    /// Whether a sync pass should pick this operation up.
    pub fn is_sync_candidate(&self, max_attempts: u32) -> bool {
        self.status == OperationStatus::Pending || self.is_retry_eligible(max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_follows_execution_order() {
        let seqs: Vec<u8> = OperationType::ALL.iter().map(|t| t.sequence()).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn labels_parse_back() {
        for t in OperationType::ALL {
            assert_eq!(t.as_str().parse::<OperationType>().unwrap(), t);
        }
        assert!("teleport".parse::<OperationType>().is_err());
    }

    #[test]
    fn job_defining_types_halt() {
        assert_eq!(OperationType::Start.failure_policy(), FailurePolicy::HaltJob);
        assert_eq!(OperationType::Complete.failure_policy(), FailurePolicy::HaltJob);
        assert_eq!(OperationType::Checklist.failure_policy(), FailurePolicy::Continue);
        assert_eq!(OperationType::AfterPhoto.failure_policy(), FailurePolicy::Continue);
    }

    #[test]
    fn retry_eligibility_stops_at_max() {
        let mut op = Operation::new(
            JobId::new(),
            OperationPayload::Message(Message {
                body: "running late".into(),
                sent_at: Utc::now(),
            }),
        );
        assert!(op.is_sync_candidate(5));
        op.status = OperationStatus::Failed;
        op.attempts = 4;
        assert!(op.is_retry_eligible(5));
        op.attempts = 5;
        assert!(!op.is_retry_eligible(5));
        assert!(!op.is_sync_candidate(5));
    }
}
