//! Run and per-table outcomes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::{export::ArtifactSummary, purge::SkipReason};
use crate::storage::StorageProvider;

/// Pipeline states. A run ends in `Done` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RunState {
    Init,
    ComputingCandidates,
    Exporting,
    Uploading,
    Purging,
    Reporting,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// Whether `next` may follow `self`.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;

        if next == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Init, ComputingCandidates)
                | (ComputingCandidates, Exporting)
                // Dry runs go straight to a simulated purge.
                | (ComputingCandidates, Purging)
                | (Exporting, Uploading)
                | (Uploading, Purging)
                | (Purging, ComputingCandidates)
                | (Purging, Reporting)
                | (Reporting, Done)
        )
    }
}

/// A failure scoped to one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableError {
    pub phase: RunState,
    pub kind: String,
    pub message: String,
}

/// Terminal result of uploading one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub table_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_location: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReport {
    pub candidate_count: u64,
    pub exported_count: u64,
    pub uploaded_count: u64,
    pub purged_count: u64,
    /// Every candidate up to the exported bound was deleted.
    pub purge_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge_skipped: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadResult>,
    pub errors: Vec<TableError>,
}

impl TableReport {
    pub fn record_error(&mut self, phase: RunState, kind: &str, message: impl Into<String>) {
        self.errors.push(TableError {
            phase,
            kind: kind.to_string(),
            message: message.into(),
        });
    }

    pub fn skip_purge(&mut self, reason: SkipReason) {
        self.purge_skipped = Some(reason);
        self.purge_complete = false;
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: Uuid,
    pub reference_time: DateTime<Utc>,
    pub cutoff: DateTime<Utc>,
    pub dry_run: bool,
    pub deployment_name: String,
    pub provider: StorageProvider,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub tables: BTreeMap<String, TableReport>,
    /// Tables in the order their purge step finished.
    pub purge_order: Vec<String>,
    /// Tables never reached because the run stopped early.
    pub not_attempted: Vec<String>,
    pub duration_ms: u64,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.state == RunState::Done
    }

    pub fn total_candidates(&self) -> u64 {
        self.tables.values().map(|t| t.candidate_count).sum()
    }

    pub fn total_purged(&self) -> u64 {
        self.tables.values().map(|t| t.purged_count).sum()
    }

    pub fn has_deletions(&self) -> bool {
        self.total_purged() > 0
    }

    pub fn error_count(&self) -> usize {
        self.tables.values().map(|t| t.errors.len()).sum()
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.get(name)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn report() -> RunReport {
        let reference = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        RunReport {
            run_id: Uuid::nil(),
            reference_time: reference,
            cutoff: reference - chrono::TimeDelta::days(30),
            dry_run: false,
            deployment_name: "airflow".into(),
            provider: StorageProvider::Local,
            state: RunState::Done,
            failure_reason: None,
            tables: BTreeMap::new(),
            purge_order: vec![],
            not_attempted: vec![],
            duration_ms: 12,
        }
    }

    #[test]
    fn test_legal_transitions() {
        use RunState::*;

        let path = [
            Init,
            ComputingCandidates,
            Exporting,
            Uploading,
            Purging,
            ComputingCandidates,
            Purging,
            Reporting,
            Done,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_illegal_transitions() {
        use RunState::*;

        assert!(!Init.can_transition_to(Exporting));
        assert!(!Exporting.can_transition_to(Purging));
        assert!(!Uploading.can_transition_to(Exporting));
        assert!(!Reporting.can_transition_to(ComputingCandidates));
        assert!(!Done.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Done));
        for state in [Init, ComputingCandidates, Exporting, Uploading, Purging, Reporting] {
            assert!(state.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_totals() {
        let mut report = report();
        assert!(!report.has_deletions());

        report.tables.insert(
            "log".into(),
            TableReport {
                candidate_count: 100,
                purged_count: 100,
                ..Default::default()
            },
        );
        let mut job = TableReport {
            candidate_count: 50,
            purged_count: 25,
            ..Default::default()
        };
        job.record_error(RunState::Uploading, "upload_error", "503");
        report.tables.insert("job".into(), job);

        assert_eq!(report.total_candidates(), 150);
        assert_eq!(report.total_purged(), 125);
        assert!(report.has_deletions());
        assert_eq!(report.error_count(), 1);
    }

    #[test]
    fn test_serialized_shape() {
        let mut report = report();
        let mut table = TableReport::default();
        table.skip_purge(SkipReason::NotUploaded);
        report.tables.insert("dag_run".into(), table);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["state"], "Done");
        assert_eq!(json["deploymentName"], "airflow");
        assert_eq!(json["provider"], "local");
        assert_eq!(json["tables"]["dag_run"]["purgeSkipped"], "not_uploaded");
        assert_eq!(json["tables"]["dag_run"]["purgedCount"], 0);
        assert!(json.get("failureReason").is_none());
    }
}
