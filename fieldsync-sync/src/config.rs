//! Sync configuration.
//!
//! [`SyncConfig`] is the serializable form (milliseconds and days, so it
//! can live in a JSON settings file). Each component takes its own runtime
//! config built from it.

use fieldsync_types::ConflictType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Serializable configuration for the whole sync stack.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub engine: EngineSettings,
    pub auto_sync: AutoSyncSettings,
    pub connectivity: ConnectivitySettings,
    pub conflicts: ConflictSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Failed attempts after which an operation is no longer retried.
    pub max_operation_attempts: u32,
    /// Age after which delivered operations of synced jobs are purged.
    pub retention_days: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_operation_attempts: 5,
            retention_days: 14,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoSyncSettings {
    /// Minimum time between two automatic sync attempts.
    pub cooldown_ms: u64,
    pub max_auto_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for AutoSyncSettings {
    fn default() -> Self {
        Self {
            cooldown_ms: 30_000,
            max_auto_retries: 3,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivitySettings {
    pub debounce_ms: u64,
}

impl Default for ConnectivitySettings {
    fn default() -> Self {
        Self { debounce_ms: 1_000 }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictSettings {
    /// Conflict types left unresolved for the user instead of being
    /// settled automatically.
    pub manual_review: Vec<ConflictType>,
}

impl SyncConfig {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_operation_attempts: self.engine.max_operation_attempts,
            retention: Duration::from_secs(u64::from(self.engine.retention_days) * 86_400),
            manual_review: self.conflicts.manual_review.iter().copied().collect(),
        }
    }

    pub fn auto_sync_config(&self) -> AutoSyncConfig {
        AutoSyncConfig {
            cooldown: Duration::from_millis(self.auto_sync.cooldown_ms),
            max_auto_retries: self.auto_sync.max_auto_retries,
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.auto_sync.backoff_base_ms),
                max: Duration::from_millis(self.auto_sync.backoff_max_ms),
            },
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            debounce: Duration::from_millis(self.connectivity.debounce_ms),
        }
    }
}

/// Runtime configuration of the [`crate::SyncEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_operation_attempts: u32,
    pub retention: Duration,
    pub manual_review: HashSet<ConflictType>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        SyncConfig::default().engine_config()
    }
}

/// Runtime configuration of the [`crate::AutoSyncOrchestrator`].
#[derive(Debug, Clone)]
pub struct AutoSyncConfig {
    pub cooldown: Duration,
    pub max_auto_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for AutoSyncConfig {
    fn default() -> Self {
        SyncConfig::default().auto_sync_config()
    }
}

/// Runtime configuration of the [`crate::ConnectivityMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub debounce: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        SyncConfig::default().monitor_config()
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}
