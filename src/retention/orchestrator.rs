//! Drives a cleanup run through its phases, one rank group at a time.
//!
//! Tables that reference others are handled first. Within a rank group the
//! phases run in lockstep: candidates for every table, then exports, then
//! uploads, then purges. A table's failure is recorded in the report and
//! only blocks that table and the tables it references.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use chrono::Utc;
use futures::{StreamExt, stream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{
    error::{CleanupError, CleanupResult},
    export::{ExportArtifact, Exporter},
    policy::{CleanupOptions, RunSettings},
    purge::{PurgeExecutor, SkipReason},
    registry::{CandidateSet, TableRegistry, TableSpec},
    report::{RunReport, RunState, TableReport, UploadResult},
};
use crate::{
    config::{CleanupConfig, RetentionConfig},
    db::{DbPool, DeleteProgress, RetentionRepo, RowKey},
    storage::{ArchiveStorage, UploadSource, archive_key, create_storage, upload_with_retry},
};

/// Run one cleanup pass against `db`.
///
/// Returns `Err` only for problems found before any table is touched:
/// an invalid policy, an unknown provider, or credentials that cannot be
/// resolved. Everything after that ends up in the report, including a
/// run that hits its deadline.
pub async fn run_cleanup(
    db: &DbPool,
    config: &CleanupConfig,
    options: &CleanupOptions,
) -> CleanupResult<RunReport> {
    CleanupOrchestrator::new(db, config).run(options).await
}

pub struct CleanupOrchestrator<'a> {
    db: &'a DbPool,
    config: &'a CleanupConfig,
    storage: Option<Arc<dyn ArchiveStorage>>,
    repo: Option<Arc<dyn RetentionRepo>>,
}

impl<'a> CleanupOrchestrator<'a> {
    pub fn new(db: &'a DbPool, config: &'a CleanupConfig) -> Self {
        Self {
            db,
            config,
            storage: None,
            repo: None,
        }
    }

    /// Use `storage` instead of building a backend from the run's provider.
    pub fn with_storage(mut self, storage: Arc<dyn ArchiveStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Read and purge through `repo` instead of the pool's own repository.
    pub fn with_repo(mut self, repo: Arc<dyn RetentionRepo>) -> Self {
        self.repo = Some(repo);
        self
    }

    pub async fn run(&self, options: &CleanupOptions) -> CleanupResult<RunReport> {
        let started = Instant::now();
        let retention = &self.config.retention;
        retention
            .validate()
            .map_err(|e| CleanupError::Config(e.to_string()))?;

        let settings = options.resolve(retention, Utc::now())?;
        let mut registry = TableRegistry::from_config(retention)?;
        if let Some(names) = &settings.table_names {
            registry = registry.select(names)?;
        }

        let storage = match &self.storage {
            Some(storage) => Arc::clone(storage),
            None => create_storage(&settings.storage_target(), &self.config.connections).await?,
        };
        let dry_run = settings.policy.dry_run();
        if !dry_run && retention.verify_bucket {
            storage.verify_access().await?;
        }

        let mut ctx = RunContext::new(&settings, &registry);
        let repo = match &self.repo {
            Some(repo) => Arc::clone(repo),
            None => self.db.retention(),
        };
        let pipeline = Pipeline {
            retention,
            exporter: Exporter::new(
                &settings.output_path,
                ctx.report.run_id,
                retention.write_buffer_bytes,
            ),
            purger: PurgeExecutor::new(
                Arc::clone(&repo),
                retention.delete_batch_size,
                retention.delete_cap(),
            ),
            settings: &settings,
            repo,
            storage,
        };

        let dry_run_msg = if dry_run { " (DRY RUN)" } else { "" };
        info!(
            run_id = %ctx.report.run_id,
            older_than_days = settings.policy.older_than_days(),
            cutoff = %settings.policy.cutoff(),
            provider = %settings.provider,
            backend = pipeline.storage.backend_name(),
            tables = registry.tables().len(),
            purge_after_export = settings.policy.purge_after_export(),
            "Starting cleanup run{}",
            dry_run_msg
        );

        let deadline = tokio::time::Instant::now() + retention.run_timeout();
        let outcome = tokio::time::timeout_at(deadline, pipeline.process(&registry, &mut ctx)).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => ctx.fail(reason),
            Err(_) => {
                ctx.interrupt();
                ctx.fail(format!(
                    "run deadline of {}s exceeded",
                    retention.run_timeout_secs
                ));
            }
        }

        let report = ctx.finish(started);
        info!(
            run_id = %report.run_id,
            state = ?report.state,
            candidates = report.total_candidates(),
            purged = report.total_purged(),
            errors = report.error_count(),
            duration_ms = report.duration_ms,
            "Cleanup run finished{}",
            dry_run_msg
        );
        Ok(report)
    }
}

/// Per-run state shared by every phase.
struct Pipeline<'a> {
    retention: &'a RetentionConfig,
    settings: &'a RunSettings,
    repo: Arc<dyn RetentionRepo>,
    storage: Arc<dyn ArchiveStorage>,
    exporter: Exporter,
    purger: PurgeExecutor,
}

/// A table moving through the phases of its rank group.
struct TableRun {
    spec: TableSpec,
    report: TableReport,
    candidates: Option<CandidateSet>,
    artifact: Option<ExportArtifact>,
    last_key: Option<RowKey>,
    /// Export found no rows, so there is nothing to upload or delete.
    empty: bool,
    uploaded: bool,
    /// A purge step ran; the table goes into the report's purge order.
    purge_ran: bool,
    /// Rows committed as deleted so far, kept current batch by batch.
    progress: DeleteProgress,
}

impl TableRun {
    fn new(spec: &TableSpec) -> Self {
        Self {
            spec: spec.clone(),
            report: TableReport::default(),
            candidates: None,
            artifact: None,
            last_key: None,
            empty: false,
            uploaded: false,
            purge_ran: false,
            progress: DeleteProgress::default(),
        }
    }
}

struct RunContext {
    report: RunReport,
    state: RunState,
    inflight: Vec<TableRun>,
}

impl RunContext {
    fn new(settings: &RunSettings, registry: &TableRegistry) -> Self {
        let policy = &settings.policy;
        Self {
            report: RunReport {
                run_id: Uuid::new_v4(),
                reference_time: policy.reference_time(),
                cutoff: policy.cutoff(),
                dry_run: policy.dry_run(),
                deployment_name: settings.deployment_name.clone(),
                provider: settings.provider,
                state: RunState::Init,
                failure_reason: None,
                tables: BTreeMap::new(),
                purge_order: Vec::new(),
                not_attempted: registry.tables().iter().map(|t| t.name.clone()).collect(),
                duration_ms: 0,
            },
            state: RunState::Init,
            inflight: Vec::new(),
        }
    }

    fn transition(&mut self, next: RunState) -> Result<(), String> {
        if !self.state.can_transition_to(next) {
            return Err(format!(
                "illegal state transition {:?} -> {next:?}",
                self.state
            ));
        }
        debug!(from = ?self.state, to = ?next, "Run state transition");
        self.state = next;
        Ok(())
    }

    fn start_group(&mut self, group: &[TableSpec]) {
        self.report
            .not_attempted
            .retain(|name| !group.iter().any(|t| &t.name == name));
        self.inflight = group.iter().map(TableRun::new).collect();
    }

    /// Move the group's outcomes into the report. Dropping the runs removes
    /// any staging file that was not retained.
    fn finish_group(&mut self) {
        for run in self.inflight.drain(..) {
            if run.purge_ran {
                self.report.purge_order.push(run.spec.name.clone());
            }
            self.report.tables.insert(run.spec.name, run.report);
        }
    }

    /// Record tables caught mid-flight by the deadline.
    fn interrupt(&mut self) {
        let phase = self.state;
        for run in &mut self.inflight {
            // Batches that committed before the deadline stay deleted.
            run.report.purged_count = run.report.purged_count.max(run.progress.deleted());
            warn!(
                table = %run.spec.name,
                phase = ?phase,
                purged = run.report.purged_count,
                "Table interrupted by run deadline"
            );
            run.report
                .record_error(phase, "interrupted", "run deadline exceeded");
            if run.report.purge_skipped.is_none() {
                run.report.skip_purge(SkipReason::Interrupted);
            }
        }
        self.finish_group();
    }

    fn fail(&mut self, reason: String) {
        error!(run_id = %self.report.run_id, reason = %reason, "Cleanup run failed");
        if self.state.can_transition_to(RunState::Failed) {
            self.state = RunState::Failed;
        }
        self.report.failure_reason = Some(reason);
    }

    fn finish(mut self, started: Instant) -> RunReport {
        if self.state == RunState::Reporting {
            self.state = RunState::Done;
        }
        self.report.state = self.state;
        self.report.duration_ms = started.elapsed().as_millis() as u64;
        self.report
    }
}

impl Pipeline<'_> {
    async fn process(&self, registry: &TableRegistry, ctx: &mut RunContext) -> Result<(), String> {
        let dry_run = self.settings.policy.dry_run();

        for group in registry.rank_groups() {
            ctx.transition(RunState::ComputingCandidates)?;
            ctx.start_group(group);
            self.for_each_table(&mut ctx.inflight, |run| self.compute_candidates(run))
                .await;

            if !dry_run {
                ctx.transition(RunState::Exporting)?;
                self.for_each_table(&mut ctx.inflight, |run| self.export_table(run))
                    .await;

                ctx.transition(RunState::Uploading)?;
                self.for_each_table(&mut ctx.inflight, |run| self.upload_table(run))
                    .await;
            }

            ctx.transition(RunState::Purging)?;
            let completed = &ctx.report.tables;
            self.for_each_table(&mut ctx.inflight, |run| self.purge_table(run, completed))
                .await;
            ctx.finish_group();
        }

        ctx.transition(RunState::Reporting)
    }

    async fn for_each_table<'r, F, Fut>(&self, runs: &'r mut [TableRun], f: F)
    where
        F: FnMut(&'r mut TableRun) -> Fut,
        Fut: Future<Output = ()>,
    {
        stream::iter(runs.iter_mut())
            .for_each_concurrent(self.retention.concurrency, f)
            .await;
    }

    async fn compute_candidates(&self, run: &mut TableRun) {
        let result = run
            .spec
            .candidate_set(
                Arc::clone(&self.repo),
                &self.settings.policy,
                self.retention.page_size,
            )
            .await;

        match result {
            Ok(Some(set)) => run.candidates = Some(set),
            Ok(None) => {
                warn!(table = %run.spec.name, "Table does not exist, skipping");
                run.report.record_error(
                    RunState::ComputingCandidates,
                    SkipReason::TableNotFound.as_str(),
                    format!("table {} does not exist", run.spec.name),
                );
                run.report.skip_purge(SkipReason::TableNotFound);
            }
            Err(e) => {
                error!(table = %run.spec.name, error = %e, "Failed to compute candidates");
                run.report.record_error(
                    RunState::ComputingCandidates,
                    "database_error",
                    e.to_string(),
                );
                run.report.skip_purge(SkipReason::CandidatesFailed);
            }
        }
    }

    async fn export_table(&self, run: &mut TableRun) {
        let Some(set) = &run.candidates else {
            return;
        };

        match self
            .exporter
            .export(&run.spec, set, &self.settings.policy)
            .await
        {
            Ok(artifact) => {
                run.report.candidate_count = artifact.row_count;
                run.report.exported_count = artifact.row_count;
                run.report.artifact = Some(artifact.summary());
                run.last_key = artifact.last_key.clone();
                run.empty = artifact.row_count == 0;
                run.artifact = Some(artifact);
            }
            Err(e) => {
                error!(table = %run.spec.name, error = %e, "Export failed");
                run.report
                    .record_error(RunState::Exporting, e.kind(), e.to_string());
                run.report.skip_purge(SkipReason::ExportFailed);
            }
        }
    }

    async fn upload_table(&self, run: &mut TableRun) {
        if run.empty {
            debug!(table = %run.spec.name, "No candidates, skipping upload");
            run.artifact = None;
            return;
        }
        let Some(artifact) = &run.artifact else {
            return;
        };

        let key = archive_key(
            &self.settings.deployment_name,
            &run.spec.name,
            &self.settings.policy.run_timestamp(),
            artifact.format.extension(),
        );
        let source = UploadSource {
            path: artifact.local_path(),
            checksum: &artifact.checksum,
            size_bytes: artifact.size_bytes,
        };
        let outcome = upload_with_retry(
            self.storage.as_ref(),
            source,
            &key,
            &self.retention.retry,
            self.retention.attempt_timeout(),
        )
        .await;
        let row_count = artifact.row_count;

        match outcome.result {
            Ok(remote) => {
                info!(
                    table = %run.spec.name,
                    location = %remote.location,
                    size = remote.size_bytes,
                    attempts = outcome.attempts,
                    "Uploaded artifact"
                );
                run.uploaded = true;
                run.report.uploaded_count = row_count;
                if let Some(summary) = run.report.artifact.as_mut() {
                    summary.local_path = None;
                    summary.remote_location = Some(remote.location.clone());
                }
                run.report.upload = Some(UploadResult {
                    table_name: run.spec.name.clone(),
                    remote_location: Some(remote.location),
                    success: true,
                    error_detail: None,
                    attempts: outcome.attempts,
                });
                if let Some(artifact) = run.artifact.take() {
                    artifact.staging.remove().await;
                }
            }
            Err(e) => {
                if let Some(artifact) = run.artifact.as_mut() {
                    artifact.staging.retain();
                    warn!(
                        table = %run.spec.name,
                        error = %e,
                        path = %artifact.local_path().display(),
                        "Upload failed, keeping local artifact"
                    );
                }
                run.report
                    .record_error(RunState::Uploading, e.kind(), e.to_string());
                run.report.upload = Some(UploadResult {
                    table_name: run.spec.name.clone(),
                    remote_location: None,
                    success: false,
                    error_detail: Some(e.to_string()),
                    attempts: outcome.attempts,
                });
            }
        }
    }

    /// Sets `purge_ran` when a purge step ran, dry or real.
    async fn purge_table(&self, run: &mut TableRun, completed: &BTreeMap<String, TableReport>) {
        let Some(set) = run.candidates.as_ref() else {
            return;
        };
        let policy = &self.settings.policy;

        if policy.dry_run() {
            match self.purger.purge(set, None, true, &run.progress).await {
                Ok(outcome) => {
                    run.report.candidate_count = outcome.candidates;
                    run.purge_ran = true;
                }
                Err(e) => {
                    error!(table = %run.spec.name, error = %e, "Failed to count candidates");
                    run.report
                        .record_error(RunState::Purging, "database_error", e.to_string());
                }
            }
            return;
        }

        if run.report.purge_skipped.is_some() {
            return;
        }
        if run.empty {
            run.report.purge_complete = true;
            run.purge_ran = true;
            return;
        }
        if policy.purge_after_export() && !run.uploaded {
            info!(table = %run.spec.name, "Artifact not uploaded, skipping purge");
            run.report.skip_purge(SkipReason::NotUploaded);
            return;
        }
        if let Some(dependent) = blocking_dependent(&run.spec, completed) {
            info!(
                table = %run.spec.name,
                dependent,
                "Dependent table not fully purged, skipping purge"
            );
            run.report.skip_purge(SkipReason::DependentsNotPurged);
            return;
        }

        let outcome = self
            .purger
            .purge(set, run.last_key.as_ref(), false, &run.progress)
            .await;
        match outcome {
            Ok(outcome) => {
                run.report.purged_count = outcome.deleted;
                run.report.purge_complete = outcome.complete;
                run.purge_ran = true;
            }
            Err(e) => {
                error!(table = %run.spec.name, error = %e, "Purge failed");
                // Batches committed before the failure stay deleted.
                run.report.purged_count = run.progress.deleted();
                run.report
                    .record_error(RunState::Purging, "database_error", e.to_string());
                run.report.purge_complete = false;
            }
        }
    }
}

/// First table referencing `spec` in this run that still holds candidates.
/// Tables outside the run's selection do not block.
fn blocking_dependent<'a>(
    spec: &'a TableSpec,
    completed: &BTreeMap<String, TableReport>,
) -> Option<&'a str> {
    spec.referenced_by
        .iter()
        .find(|dep| completed.get(*dep).is_some_and(|r| !r.purge_complete))
        .map(String::as_str)
}

#[cfg(all(test, feature = "database-sqlite"))]
mod tests {
    use std::{path::Path, time::Duration};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        config::{KeyColumns, TableConfig},
        db::{
            CandidateQuery, CandidateRow, ColumnInfo, DbResult, DeleteOutcome, DeleteRequest,
            sqlite::SqliteRetentionRepo, tests::harness,
        },
        storage::{RemoteObject, StorageError, StorageResult},
    };

    const OLD: &str = "2020-01-01 00:00:00";

    fn fresh() -> String {
        Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
    }

    fn options(dir: &Path, pairs: &[(&str, &str)]) -> CleanupOptions {
        let mut options = CleanupOptions::from_pairs(pairs.iter().copied()).unwrap();
        options.output_path = Some(dir.to_path_buf());
        options
    }

    fn table(name: &str, ts: &str, rank: u32, referenced_by: &[&str]) -> TableConfig {
        TableConfig {
            name: name.into(),
            timestamp_column: ts.into(),
            key_column: if name == "task_instance" {
                KeyColumns::Composite(
                    harness::TASK_INSTANCE_KEY
                        .iter()
                        .map(|k| k.to_string())
                        .collect(),
                )
            } else {
                "id".into()
            },
            rank,
            referenced_by: referenced_by.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Storage that rejects every upload.
    struct RejectingStorage;

    #[async_trait]
    impl ArchiveStorage for RejectingStorage {
        async fn verify_access(&self) -> StorageResult<()> {
            Ok(())
        }

        async fn upload(&self, _: UploadSource<'_>, _: &str) -> StorageResult<RemoteObject> {
            Err(StorageError::BucketNotFound("archive".into()))
        }

        fn backend_name(&self) -> &'static str {
            "rejecting"
        }
    }

    /// Storage whose uploads never finish in time.
    struct StalledStorage;

    #[async_trait]
    impl ArchiveStorage for StalledStorage {
        async fn verify_access(&self) -> StorageResult<()> {
            Ok(())
        }

        async fn upload(&self, _: UploadSource<'_>, _: &str) -> StorageResult<RemoteObject> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(StorageError::Upload("stalled".into()))
        }

        fn backend_name(&self) -> &'static str {
            "stalled"
        }
    }

    /// Repository whose purge commits one capped pass, then hangs.
    struct StallingPurgeRepo {
        inner: SqliteRetentionRepo,
        commit_before_stall: u64,
    }

    #[async_trait]
    impl RetentionRepo for StallingPurgeRepo {
        async fn table_columns(&self, table: &str) -> DbResult<Vec<ColumnInfo>> {
            self.inner.table_columns(table).await
        }

        async fn fetch_candidates(
            &self,
            query: &CandidateQuery,
            after_key: Option<&RowKey>,
            limit: u32,
        ) -> DbResult<Vec<CandidateRow>> {
            self.inner.fetch_candidates(query, after_key, limit).await
        }

        async fn delete_candidates(&self, request: &DeleteRequest) -> DbResult<DeleteOutcome> {
            let capped = DeleteRequest {
                max_deletes: Some(self.commit_before_stall),
                ..request.clone()
            };
            self.inner.delete_candidates(&capped).await?;
            std::future::pending().await
        }
    }

    async fn scheduler_db() -> (sqlx::SqlitePool, DbPool) {
        let pool = harness::scheduler_pool().await;
        let db = DbPool::from_sqlite(pool.clone());
        (pool, db)
    }

    #[tokio::test]
    async fn test_dry_run_counts_and_leaves_rows() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "task_instance", 1..1201, OLD).await;
        harness::seed_rows(&pool, "task_instance", 1201..1211, &fresh()).await;
        let dir = TempDir::new().unwrap();

        let report = run_cleanup(
            &db,
            &CleanupConfig::default(),
            &options(dir.path(), &[("olderThan", "30"), ("dryRun", "true")]),
        )
        .await
        .unwrap();

        assert_eq!(report.state, RunState::Done);
        assert!(report.dry_run);
        let ti = report.table("task_instance").unwrap();
        assert_eq!(ti.candidate_count, 1200);
        assert_eq!(ti.exported_count, 0);
        assert_eq!(ti.purged_count, 0);
        assert!(ti.artifact.is_none());
        assert_eq!(harness::count_rows(&pool, "task_instance").await, 1210);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_local_export_upload_and_purge() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "log", 1..501, OLD).await;
        harness::seed_rows(&pool, "log", 501..511, &fresh()).await;
        let dir = TempDir::new().unwrap();

        let report = run_cleanup(
            &db,
            &CleanupConfig::default(),
            &options(
                dir.path(),
                &[
                    ("olderThan", "30"),
                    ("dryRun", "false"),
                    ("purgeTable", "true"),
                    ("deploymentName", "prod"),
                ],
            ),
        )
        .await
        .unwrap();

        assert!(report.is_success(), "{report:?}");
        let log = report.table("log").unwrap();
        assert_eq!(log.candidate_count, 500);
        assert_eq!(log.exported_count, 500);
        assert_eq!(log.uploaded_count, 500);
        assert_eq!(log.purged_count, 500);
        assert!(log.purge_complete);
        assert_eq!(harness::count_rows(&pool, "log").await, 10);

        let artifact = log.artifact.as_ref().unwrap();
        assert!(artifact.local_path.is_none());
        let remote = artifact.remote_location.as_ref().unwrap();
        let archived = std::fs::read_to_string(remote).unwrap();
        assert_eq!(archived.lines().count(), 501);
        assert!(remote.contains("prod/log/"));

        // Staging file was removed after upload; only the archive dir remains.
        let staged: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(staged, vec![std::ffi::OsString::from("archive")]);
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_before_export() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "log", 1..11, OLD).await;
        let dir = TempDir::new().unwrap();

        let err = run_cleanup(
            &db,
            &CleanupConfig::default(),
            &options(
                dir.path(),
                &[
                    ("olderThan", "30"),
                    ("dryRun", "false"),
                    ("provider", "aws"),
                    ("bucketName", "archive"),
                ],
            ),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            CleanupError::Storage(StorageError::Credential(_))
        ));
        assert_eq!(harness::count_rows(&pool, "log").await, 10);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_second_run_purges_nothing() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "job", 1..51, OLD).await;
        let dir = TempDir::new().unwrap();
        let config = CleanupConfig::default();
        let opts = options(dir.path(), &[("olderThan", "30"), ("dryRun", "false")]);

        let first = run_cleanup(&db, &config, &opts).await.unwrap();
        let second = run_cleanup(&db, &config, &opts).await.unwrap();

        assert_eq!(first.total_purged(), 50);
        assert_eq!(second.total_purged(), 0);
        assert!(second.is_success());
        assert_eq!(harness::count_rows(&pool, "job").await, 0);
    }

    #[tokio::test]
    async fn test_dependents_purge_before_referenced_tables() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "task_fail", 1..6, OLD).await;
        harness::seed_rows(&pool, "task_instance", 1..11, OLD).await;
        harness::seed_rows(&pool, "dag_run", 1..4, OLD).await;
        let dir = TempDir::new().unwrap();

        let report = run_cleanup(
            &db,
            &CleanupConfig::default(),
            &options(dir.path(), &[("olderThan", "30"), ("dryRun", "false")]),
        )
        .await
        .unwrap();

        let position = |name: &str| {
            report
                .purge_order
                .iter()
                .position(|t| t == name)
                .unwrap_or_else(|| panic!("{name} missing from purge order"))
        };
        assert!(position("task_fail") < position("task_instance"));
        assert!(position("task_reschedule") < position("task_instance"));
        assert!(position("task_instance") < position("dag_run"));
        assert_eq!(report.total_purged(), 18);
    }

    #[tokio::test]
    async fn test_failed_upload_blocks_purge_when_required() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "log", 1..21, OLD).await;
        let dir = TempDir::new().unwrap();
        let config = CleanupConfig::default();

        let report = CleanupOrchestrator::new(&db, &config)
            .with_storage(Arc::new(RejectingStorage))
            .run(&options(
                dir.path(),
                &[
                    ("olderThan", "30"),
                    ("dryRun", "false"),
                    ("purgeTable", "true"),
                    ("tableNames", "log"),
                ],
            ))
            .await
            .unwrap();

        let log = report.table("log").unwrap();
        assert_eq!(log.purge_skipped, Some(SkipReason::NotUploaded));
        assert_eq!(log.purged_count, 0);
        assert_eq!(log.errors[0].kind, "bucket_not_found");
        assert!(!log.upload.as_ref().unwrap().success);
        assert_eq!(harness::count_rows(&pool, "log").await, 20);

        let local = log.artifact.as_ref().unwrap().local_path.as_ref().unwrap();
        assert!(Path::new(local).exists());
        assert_eq!(report.state, RunState::Done);
    }

    #[tokio::test]
    async fn test_failed_upload_still_purges_when_not_required() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "log", 1..21, OLD).await;
        let dir = TempDir::new().unwrap();
        let config = CleanupConfig::default();

        let report = CleanupOrchestrator::new(&db, &config)
            .with_storage(Arc::new(RejectingStorage))
            .run(&options(
                dir.path(),
                &[
                    ("olderThan", "30"),
                    ("dryRun", "false"),
                    ("tableNames", "log"),
                ],
            ))
            .await
            .unwrap();

        let log = report.table("log").unwrap();
        assert_eq!(log.purged_count, 20);
        assert_eq!(log.uploaded_count, 0);
        let local = log.artifact.as_ref().unwrap().local_path.as_ref().unwrap();
        assert!(Path::new(local).exists());
    }

    #[tokio::test]
    async fn test_incomplete_dependent_blocks_parent() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "task_instance", 1..31, OLD).await;
        harness::seed_rows(&pool, "dag_run", 1..6, OLD).await;
        let dir = TempDir::new().unwrap();
        let mut config = CleanupConfig::default();
        config.retention.max_deletes_per_run = 10;
        config.retention.delete_batch_size = 5;

        let report = run_cleanup(
            &db,
            &config,
            &options(
                dir.path(),
                &[
                    ("olderThan", "30"),
                    ("dryRun", "false"),
                    ("tableNames", "task_instance,dag_run"),
                ],
            ),
        )
        .await
        .unwrap();

        let ti = report.table("task_instance").unwrap();
        assert_eq!(ti.purged_count, 10);
        assert!(!ti.purge_complete);
        let dag_run = report.table("dag_run").unwrap();
        assert_eq!(dag_run.purge_skipped, Some(SkipReason::DependentsNotPurged));
        assert_eq!(harness::count_rows(&pool, "dag_run").await, 5);
        assert_eq!(harness::count_rows(&pool, "task_instance").await, 20);
    }

    #[tokio::test]
    async fn test_missing_table_is_reported_not_fatal() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "log", 1..4, OLD).await;
        let dir = TempDir::new().unwrap();
        let mut config = CleanupConfig::default();
        config.retention.tables = Some(vec![
            table("log", "dttm", 0, &[]),
            table("audit_trail", "created_at", 0, &[]),
        ]);

        let report = run_cleanup(
            &db,
            &config,
            &options(dir.path(), &[("olderThan", "30"), ("dryRun", "false")]),
        )
        .await
        .unwrap();

        assert!(report.is_success());
        let audit = report.table("audit_trail").unwrap();
        assert_eq!(audit.purge_skipped, Some(SkipReason::TableNotFound));
        assert_eq!(audit.errors[0].kind, "table_not_found");
        assert_eq!(report.table("log").unwrap().purged_count, 3);
    }

    #[tokio::test]
    async fn test_unknown_table_selection_is_rejected() {
        let (_pool, db) = scheduler_db().await;
        let dir = TempDir::new().unwrap();

        let err = run_cleanup(
            &db,
            &CleanupConfig::default(),
            &options(dir.path(), &[("olderThan", "30"), ("tableNames", "nope")]),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CleanupError::InvalidPolicy(_)));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_run() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "task_instance", 1..11, OLD).await;
        harness::seed_rows(&pool, "dag_run", 1..4, OLD).await;
        let dir = TempDir::new().unwrap();
        let mut config = CleanupConfig::default();
        config.retention.run_timeout_secs = 1;
        config.retention.attempt_timeout_secs = 60;
        config.retention.tables = Some(vec![
            table("task_instance", "start_date", 0, &[]),
            table("dag_run", "start_date", 1, &["task_instance"]),
        ]);

        let report = CleanupOrchestrator::new(&db, &config)
            .with_storage(Arc::new(StalledStorage))
            .run(&options(
                dir.path(),
                &[("olderThan", "30"), ("dryRun", "false")],
            ))
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Failed);
        assert!(report.failure_reason.as_ref().unwrap().contains("deadline"));
        let ti = report.table("task_instance").unwrap();
        assert_eq!(ti.purge_skipped, Some(SkipReason::Interrupted));
        assert_eq!(ti.errors.last().unwrap().phase, RunState::Uploading);
        assert_eq!(report.not_attempted, vec!["dag_run".to_string()]);
        assert_eq!(harness::count_rows(&pool, "task_instance").await, 10);
        assert_eq!(harness::count_rows(&pool, "dag_run").await, 3);
    }

    #[tokio::test]
    async fn test_deadline_during_purge_reports_committed_rows() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "log", 1..41, OLD).await;
        let dir = TempDir::new().unwrap();
        let mut config = CleanupConfig::default();
        config.retention.run_timeout_secs = 1;
        config.retention.delete_batch_size = 2;
        config.retention.tables = Some(vec![table("log", "dttm", 0, &[])]);
        let repo = Arc::new(StallingPurgeRepo {
            inner: SqliteRetentionRepo::new(pool.clone()),
            commit_before_stall: 6,
        });

        let report = CleanupOrchestrator::new(&db, &config)
            .with_repo(repo)
            .run(&options(
                dir.path(),
                &[("olderThan", "30"), ("dryRun", "false")],
            ))
            .await
            .unwrap();

        assert_eq!(report.state, RunState::Failed);
        let log = report.table("log").unwrap();
        assert_eq!(log.errors.last().unwrap().phase, RunState::Purging);
        assert_eq!(log.purge_skipped, Some(SkipReason::Interrupted));
        assert_eq!(log.purged_count, 6);
        assert_eq!(harness::count_rows(&pool, "log").await, 34);
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected_before_run() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "log", 1..4, OLD).await;
        let dir = TempDir::new().unwrap();
        let mut config = CleanupConfig::default();
        config.retention.concurrency = 0;

        let err = run_cleanup(
            &db,
            &config,
            &options(dir.path(), &[("olderThan", "30"), ("dryRun", "false")]),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, CleanupError::Config(_)));
        assert!(err.to_string().contains("concurrency"));
        assert_eq!(harness::count_rows(&pool, "log").await, 3);
    }

    #[tokio::test]
    async fn test_run_can_be_spawned() {
        let (pool, db) = scheduler_db().await;
        harness::seed_rows(&pool, "log", 1..4, OLD).await;
        let dir = TempDir::new().unwrap();
        let options = options(dir.path(), &[("olderThan", "30")]);

        let report = tokio::spawn(async move {
            run_cleanup(&db, &CleanupConfig::default(), &options).await
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.table("log").unwrap().candidate_count, 3);
    }
}
