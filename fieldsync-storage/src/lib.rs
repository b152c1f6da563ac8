//! SQLite storage layer for fieldsync.
//!
//! Holds the three durable collections the sync engine works against:
//!
//! - **jobs**: the locally held job records (read-mostly for the engine)
//! - **operations**: the ordered queue of deferred network effects
//! - **conflicts**: detected divergences and their resolutions
//!
//! Multi-record writes (enqueue, finalizing synced jobs, applying a
//! server-wins resolution) run inside a single SQLite transaction.

mod conflicts;
mod error;
mod jobs;
mod queue;
mod store;

pub use error::{StorageError, StorageResult};
pub use queue::QueueCounts;
pub use store::SyncStore;
