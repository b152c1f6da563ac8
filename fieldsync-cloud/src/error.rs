//! HTTP client error types.

use fieldsync_sync::SyncError;
use thiserror::Error;

/// Result type for job API calls.
pub type CloudResult<T> = Result<T, CloudError>;

/// Errors that can occur talking to the job API.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// 409 and 410 mean the server refuses the job itself, not this request.
impl From<CloudError> for SyncError {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::Status {
                status: 409 | 410,
                message,
            } => SyncError::Rejected(message),
            CloudError::Status { status, message } => SyncError::Remote { status, message },
            CloudError::Http(e) => SyncError::Network(e.to_string()),
            CloudError::Serialization(e) => SyncError::Network(format!("malformed response: {e}")),
        }
    }
}
