//! HTTP transport for fieldsync.
//!
//! [`JobApiClient`] implements [`fieldsync_sync::JobApi`] against the job
//! API: one lookup route plus one write route per operation type.

pub mod api_client;
pub mod config;
pub mod error;

pub use api_client::JobApiClient;
pub use config::ApiConfig;
pub use error::{CloudError, CloudResult};
