//! Export-then-purge retention for scheduler metadata databases.
//!
//! Old rows are streamed out of the metadata store into CSV artifacts,
//! archived to local disk, S3, GCS or Azure Blob Storage, and only then
//! deleted. See [`run_cleanup`] for a single pass and
//! [`retention::start_cleanup_worker`] for a periodic one.

pub mod config;
pub mod db;
#[cfg(feature = "cli")]
pub mod observability;
pub mod retention;
pub mod storage;

pub use config::CleanupConfig;
pub use db::DbPool;
pub use retention::{CleanupError, CleanupOptions, RunReport, run_cleanup};
