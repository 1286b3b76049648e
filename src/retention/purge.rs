//! Deletion of exported candidates from the live store.

use std::{fmt, sync::Arc};

use futures::TryStreamExt;
use serde::Serialize;
use tracing::{debug, info};

use super::registry::CandidateSet;
use crate::db::{DbResult, DeleteProgress, DeleteRequest, RetentionRepo, RowKey};

/// Keys logged by a dry run.
const DRY_RUN_SAMPLE_SIZE: usize = 10;

/// Why a table's purge did not run. Recorded, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The table does not exist in the database.
    TableNotFound,
    /// Candidates could not be read.
    CandidatesFailed,
    ExportFailed,
    /// `purgeAfterExport` is set and the artifact was not uploaded.
    NotUploaded,
    /// A table referencing this one did not purge completely.
    DependentsNotPurged,
    /// The run deadline passed before the table finished.
    Interrupted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::TableNotFound => "table_not_found",
            SkipReason::CandidatesFailed => "candidates_failed",
            SkipReason::ExportFailed => "export_failed",
            SkipReason::NotUploaded => "not_uploaded",
            SkipReason::DependentsNotPurged => "dependents_not_purged",
            SkipReason::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a purge, real or simulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Rows that matched. Counted only in dry runs.
    pub candidates: u64,
    pub deleted: u64,
    /// Every matching row up to the bound is gone. False when the
    /// per-run cap stopped deletion early.
    pub complete: bool,
}

/// Deletes candidates in bounded batches.
pub struct PurgeExecutor {
    repo: Arc<dyn RetentionRepo>,
    batch_size: u32,
    max_deletes: Option<u64>,
}

impl PurgeExecutor {
    pub fn new(repo: Arc<dyn RetentionRepo>, batch_size: u32, max_deletes: Option<u64>) -> Self {
        Self {
            repo,
            batch_size,
            max_deletes,
        }
    }

    /// Purge `candidates` with keys up to `max_key`.
    ///
    /// In a dry run the candidates are counted and a sample of keys is
    /// logged; nothing is deleted. Otherwise rows are deleted in batches of
    /// `batch_size`, each batch committed on its own and added to
    /// `progress`. A `max_key` of `None` means nothing was exported, so
    /// nothing is deleted.
    pub async fn purge(
        &self,
        candidates: &CandidateSet,
        max_key: Option<&RowKey>,
        dry_run: bool,
        progress: &DeleteProgress,
    ) -> DbResult<PurgeOutcome> {
        let query = candidates.query();

        if dry_run {
            let (count, sample) = candidates
                .stream()
                .try_fold((0u64, Vec::new()), |(count, mut sample), row| async move {
                    if sample.len() < DRY_RUN_SAMPLE_SIZE {
                        sample.push(row.key.to_string());
                    }
                    Ok((count + 1, sample))
                })
                .await?;

            info!(
                table = %query.table,
                rows = count,
                cutoff = %query.cutoff,
                sample_keys = ?sample,
                "DRY RUN: Would delete rows"
            );
            return Ok(PurgeOutcome {
                candidates: count,
                deleted: 0,
                complete: true,
            });
        }

        let Some(max_key) = max_key else {
            debug!(table = %query.table, "Nothing exported, nothing to purge");
            return Ok(PurgeOutcome {
                complete: true,
                ..Default::default()
            });
        };

        let outcome = self
            .repo
            .delete_candidates(&DeleteRequest {
                table: query.table.clone(),
                timestamp_column: query.timestamp_column.clone(),
                key_columns: query.key_columns.clone(),
                cutoff: query.cutoff,
                max_key: max_key.clone(),
                batch_size: self.batch_size,
                max_deletes: self.max_deletes,
                progress: progress.clone(),
            })
            .await?;

        info!(
            table = %query.table,
            rows = outcome.deleted,
            cutoff = %query.cutoff,
            complete = outcome.exhausted,
            "Purged rows"
        );

        Ok(PurgeOutcome {
            candidates: 0,
            deleted: outcome.deleted,
            complete: outcome.exhausted,
        })
    }
}
