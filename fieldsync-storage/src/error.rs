//! Storage error types.

use fieldsync_types::{ConflictId, JobId, OperationId};
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in the durable store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("job {0} is locked")]
    JobLocked(JobId),

    #[error("operation {0} is already completed")]
    OperationCompleted(OperationId),

    #[error("conflict {0} is already resolved")]
    ConflictResolved(ConflictId),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}
