//! Background worker that runs cleanup on a fixed interval.

use std::sync::Arc;

use super::{orchestrator::run_cleanup, policy::CleanupOptions};
use crate::{config::CleanupConfig, db::DbPool};

/// Starts the cleanup worker.
///
/// Runs `retention.schedule.options` every `interval_hours` until the task
/// is cancelled. Returns immediately when the schedule is disabled or its
/// options do not parse.
pub async fn start_cleanup_worker(db: Arc<DbPool>, config: Arc<CleanupConfig>) {
    let schedule = &config.retention.schedule;
    if !schedule.enabled {
        tracing::info!("Cleanup worker disabled by configuration");
        return;
    }

    let options = match CleanupOptions::from_pairs(&schedule.options) {
        Ok(options) => options,
        Err(e) => {
            tracing::error!(error = %e, "Invalid scheduled cleanup options, worker not started");
            return;
        }
    };

    let dry_run = options.dry_run.unwrap_or(true);
    let dry_run_msg = if dry_run { " (DRY RUN)" } else { "" };

    tracing::info!(
        interval_hours = schedule.interval_hours,
        older_than = options.older_than,
        provider = options.provider.as_deref().unwrap_or("local"),
        dry_run,
        "Starting cleanup worker{}",
        dry_run_msg
    );

    let interval = schedule.interval();

    loop {
        match run_cleanup(&db, &config, &options).await {
            Ok(report) if !report.is_success() => {
                tracing::warn!(
                    run_id = %report.run_id,
                    reason = report.failure_reason.as_deref().unwrap_or("unknown"),
                    purged = report.total_purged(),
                    "Scheduled cleanup run did not complete"
                );
            }
            Ok(report) if report.has_deletions() => {
                tracing::info!(
                    run_id = %report.run_id,
                    candidates = report.total_candidates(),
                    purged = report.total_purged(),
                    errors = report.error_count(),
                    "Scheduled cleanup run complete{}",
                    dry_run_msg
                );
            }
            Ok(report) => {
                tracing::debug!(
                    run_id = %report.run_id,
                    candidates = report.total_candidates(),
                    "Scheduled cleanup run complete, no records deleted"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, kind = e.kind(), "Error running scheduled cleanup");
            }
        }

        tokio::time::sleep(interval).await;
    }
}
