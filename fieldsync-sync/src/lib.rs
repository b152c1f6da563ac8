//! Offline-first sync for fieldsync.
//!
//! Provides delivery of the durable operation queue with:
//! - Per-job ordering by operation sequence number
//! - Pre-flight conflict detection and rule-based resolution
//! - A single-flight sync engine with per-operation retry bookkeeping
//! - An auto-sync orchestrator (cooldown, exponential backoff, retry timer)
//! - A debounced connectivity monitor

pub mod config;
pub mod connectivity;
pub mod engine;
pub mod error;
mod flight;
pub mod handlers;
pub mod listeners;
pub mod orchestrator;
pub mod resolver;

pub use config::{AutoSyncConfig, BackoffPolicy, EngineConfig, MonitorConfig, SyncConfig};
pub use connectivity::{
    ConnectionType, ConnectivityChange, ConnectivityMonitor, ConnectivityStatus,
    ConnectivityTransport, NetworkProbe, NetworkState,
};
pub use engine::{
    CurrentOperation, OperationError, SkipReason, SyncEngine, SyncOutcome, SyncProgress,
    SyncStatus, order_for_delivery,
};
pub use error::{SyncError, SyncResult};
pub use handlers::{Credential, HandlerOutcome, JobApi, PhotoStage, RemoteAck, dispatch};
pub use listeners::{Listeners, Subscription};
pub use orchestrator::{
    AutoSyncEvent, AutoSyncOrchestrator, AutoSyncState, PreloadHook, TriggerOutcome,
};
pub use resolver::{ConflictResolver, DetectedConflict};
