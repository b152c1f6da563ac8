//! Record types shared by the fieldsync crates.
//!
//! - [`Operation`]: one deferred network effect, ordered within its job by
//!   a sequence number derived from its [`OperationType`]
//! - [`Job`]: the locally held job record the queue refers to
//! - [`RemoteJob`]: the server's view of a job, fetched before syncing
//! - [`Conflict`]: a recorded divergence between the two

mod conflict;
mod ids;
mod job;
mod operation;

pub use conflict::{Conflict, ConflictType, Resolution};
pub use ids::{ConflictId, JobId, OperationId};
pub use job::{Job, JobStatus, RemoteJob};
pub use operation::{
    ChecklistUpdate, CompletionReport, FailurePolicy, LocationFix, Message, Operation,
    OperationPayload, OperationStatus, OperationType, PhotoRef, StartReport,
};

use thiserror::Error;

/// Error returned when parsing a persisted enum label fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseLabelError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseLabelError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
