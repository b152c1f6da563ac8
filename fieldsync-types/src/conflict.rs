//! Recorded divergences between local and remote job state.

use crate::{ConflictId, JobId, ParseLabelError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The job was cancelled or removed on the server.
    Cancellation,
    /// A second worker is running the same job.
    MultiCleaner,
    /// The server copy changed since this device last saw it.
    DataMismatch,
}

impl ConflictType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::Cancellation => "cancellation",
            ConflictType::MultiCleaner => "multi_cleaner",
            ConflictType::DataMismatch => "data_mismatch",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictType {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancellation" => Ok(ConflictType::Cancellation),
            "multi_cleaner" => Ok(ConflictType::MultiCleaner),
            "data_mismatch" => Ok(ConflictType::DataMismatch),
            other => Err(ParseLabelError::new("conflict type", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    LocalWins,
    ServerWins,
    Merged,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::LocalWins => "local_wins",
            Resolution::ServerWins => "server_wins",
            Resolution::Merged => "merged",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_wins" => Ok(Resolution::LocalWins),
            "server_wins" => Ok(Resolution::ServerWins),
            "merged" => Ok(Resolution::Merged),
            other => Err(ParseLabelError::new("resolution", other)),
        }
    }
}

/// A durably recorded conflict. Once `resolved` is set the resolution
/// never changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub job_id: JobId,
    pub conflict_type: ConflictType,
    pub reason: Option<String>,
    pub local_snapshot: serde_json::Value,
    pub server_snapshot: serde_json::Value,
    pub resolution: Option<Resolution>,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Conflict {
    pub fn new(
        job_id: JobId,
        conflict_type: ConflictType,
        local_snapshot: serde_json::Value,
        server_snapshot: serde_json::Value,
    ) -> Self {
        Self {
            id: ConflictId::new(),
            job_id,
            conflict_type,
            reason: None,
            local_snapshot,
            server_snapshot,
            resolution: None,
            resolved: false,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
