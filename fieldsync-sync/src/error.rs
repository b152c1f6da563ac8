//! Sync error types.

use fieldsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while syncing.
///
/// Skip conditions (offline, no credential, cooldown, already syncing) are
/// not errors; they are reported as [`crate::SkipReason`] values.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("network error: {0}")]
    Network(String),

    #[error("server returned {status}: {message}")]
    Remote { status: u16, message: String },

    /// The server refused the job outright; retrying later operations of
    /// the same job in this pass is pointless.
    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("connectivity transport error: {0}")]
    Transport(String),

    #[error("background task failed: {0}")]
    TaskJoin(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}

impl SyncError {
    /// Whether this failure should stop the rest of the job's operations
    /// regardless of the operation type's own failure policy.
    pub fn halts_job(&self) -> bool {
        matches!(self, SyncError::Rejected(_))
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::TaskJoin(e.to_string())
    }
}
