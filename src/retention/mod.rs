//! Export-then-purge retention for metadata tables.
//!
//! A run resolves a [`RetentionPolicy`] from caller options, walks the
//! [`TableRegistry`] in dependency order, streams each table's candidates
//! into a CSV artifact, uploads it to archive storage and then deletes the
//! exported rows in bounded batches. Rows are only ever deleted up to the
//! greatest key that was exported, and dry runs delete nothing.
//!
//! [`start_cleanup_worker`] repeats a configured run on an interval.

mod error;
mod export;
mod orchestrator;
mod policy;
mod purge;
mod registry;
mod report;
mod worker;

pub use error::{CleanupError, CleanupResult, ExportError};
pub use export::{ArtifactSummary, ExportArtifact, Exporter, StagingFile};
pub use orchestrator::{CleanupOrchestrator, run_cleanup};
pub use policy::{CleanupOptions, ExportFormat, RetentionPolicy, RunSettings};
pub use purge::{PurgeExecutor, PurgeOutcome, SkipReason};
pub use registry::{CandidateSet, TableRegistry, TableSpec};
pub use report::{RunReport, RunState, TableError, TableReport, UploadResult};
pub use worker::start_cleanup_worker;
