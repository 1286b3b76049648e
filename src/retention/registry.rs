//! Tables subject to cleanup and the order they are processed in.

use std::{collections::HashMap, sync::Arc};

use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use serde::Serialize;
use tracing::warn;

use super::{
    error::{CleanupError, CleanupResult},
    policy::RetentionPolicy,
};
use crate::{
    config::{RetentionConfig, TableConfig},
    db::{
        CandidateQuery, CandidateRow, DbError, DbResult, RetentionRepo, RowKey,
        is_valid_identifier,
    },
};

/// A table under retention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSpec {
    pub name: String,
    pub timestamp_column: String,
    /// Unique, orderable key. Several columns form a composite key.
    pub key_columns: Vec<String>,
    /// Lower ranks are purged first.
    pub rank: u32,
    /// Tables holding references into this one.
    pub referenced_by: Vec<String>,
}

impl TableSpec {
    pub fn new(name: &str, timestamp_column: &str, rank: u32) -> Self {
        Self {
            name: name.to_string(),
            timestamp_column: timestamp_column.to_string(),
            key_columns: vec!["id".to_string()],
            rank,
            referenced_by: Vec::new(),
        }
    }

    pub fn key_columns(mut self, columns: &[&str]) -> Self {
        self.key_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn referenced_by(mut self, tables: &[&str]) -> Self {
        self.referenced_by = tables.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Resolve this table's live columns and build its candidate set.
    ///
    /// Returns `None` if the table does not exist in the database.
    pub async fn candidate_set(
        &self,
        repo: Arc<dyn RetentionRepo>,
        policy: &RetentionPolicy,
        page_size: u32,
    ) -> DbResult<Option<CandidateSet>> {
        let columns = repo.table_columns(&self.name).await?;
        if columns.is_empty() {
            return Ok(None);
        }

        let key_columns = self
            .key_columns
            .iter()
            .map(|key| {
                columns.iter().find(|c| &c.name == key).cloned().ok_or_else(|| {
                    DbError::Validation(format!("table {} has no key column {key}", self.name))
                })
            })
            .collect::<DbResult<Vec<_>>>()?;
        if !columns.iter().any(|c| c.name == self.timestamp_column) {
            return Err(DbError::Validation(format!(
                "table {} has no timestamp column {}",
                self.name, self.timestamp_column
            )));
        }

        Ok(Some(CandidateSet {
            repo,
            query: CandidateQuery {
                table: self.name.clone(),
                timestamp_column: self.timestamp_column.clone(),
                key_columns,
                columns: columns.into_iter().map(|c| c.name).collect(),
                cutoff: policy.cutoff(),
            },
            page_size,
        }))
    }
}

impl From<&TableConfig> for TableSpec {
    fn from(config: &TableConfig) -> Self {
        Self {
            name: config.name.clone(),
            timestamp_column: config.timestamp_column.clone(),
            key_columns: config.key_column.names(),
            rank: config.rank,
            referenced_by: config.referenced_by.clone(),
        }
    }
}

/// The candidate rows of one table, in key order.
///
/// Each call to [`CandidateSet::stream`] issues fresh queries, one page at a
/// time, so memory is bounded by the page size.
pub struct CandidateSet {
    repo: Arc<dyn RetentionRepo>,
    query: CandidateQuery,
    page_size: u32,
}

impl CandidateSet {
    pub fn query(&self) -> &CandidateQuery {
        &self.query
    }

    /// Column names in declared schema order.
    pub fn columns(&self) -> &[String] {
        &self.query.columns
    }

    pub fn stream(&self) -> BoxStream<'static, DbResult<CandidateRow>> {
        let repo = Arc::clone(&self.repo);
        let query = self.query.clone();
        let page_size = self.page_size;

        // State: `Some(cursor)` while pages remain, `None` once exhausted.
        stream::try_unfold(Some(None::<RowKey>), move |state| {
            let repo = Arc::clone(&repo);
            let query = query.clone();
            async move {
                let Some(after_key) = state else {
                    return Ok::<_, DbError>(None);
                };
                let page = repo
                    .fetch_candidates(&query, after_key.as_ref(), page_size)
                    .await?;
                if page.is_empty() {
                    return Ok(None);
                }
                let next = if (page.len() as u32) < page_size {
                    None
                } else {
                    Some(page.last().map(|row| row.key.clone()))
                };
                Ok(Some((page, next)))
            }
        })
        .map_ok(|page| stream::iter(page.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }
}

/// Ordered set of tables to clean.
#[derive(Debug, Clone)]
pub struct TableRegistry {
    /// Sorted by rank, then name.
    tables: Vec<TableSpec>,
}

impl TableRegistry {
    /// Validate and order `tables`.
    pub fn new(mut tables: Vec<TableSpec>) -> CleanupResult<Self> {
        if tables.is_empty() {
            return Err(CleanupError::InvalidPolicy("no tables registered".into()));
        }

        let mut ranks: HashMap<&str, u32> = HashMap::new();
        for table in &tables {
            if table.key_columns.is_empty() {
                return Err(CleanupError::InvalidPolicy(format!(
                    "table {} has no key columns",
                    table.name
                )));
            }
            let identifiers = [&table.name, &table.timestamp_column]
                .into_iter()
                .chain(&table.key_columns);
            for ident in identifiers {
                if !is_valid_identifier(ident) {
                    return Err(CleanupError::InvalidPolicy(format!(
                        "'{ident}' in table {} is not a valid identifier",
                        table.name
                    )));
                }
            }
            if ranks.insert(&table.name, table.rank).is_some() {
                return Err(CleanupError::InvalidPolicy(format!(
                    "table {} is registered twice",
                    table.name
                )));
            }
        }

        for table in &tables {
            for dependent in &table.referenced_by {
                let dependent_rank = ranks.get(dependent.as_str()).ok_or_else(|| {
                    CleanupError::InvalidPolicy(format!(
                        "table {} is referenced by unknown table {dependent}",
                        table.name
                    ))
                })?;
                if *dependent_rank >= table.rank {
                    return Err(CleanupError::InvalidPolicy(format!(
                        "table {dependent} references {} and must have a lower rank ({dependent_rank} >= {})",
                        table.name, table.rank
                    )));
                }
            }
        }

        tables.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.name.cmp(&b.name)));
        Ok(Self { tables })
    }

    /// Workflow scheduler metadata tables.
    pub fn scheduler_default() -> Self {
        let mut tables = vec![
            TableSpec::new("callback_request", "created_at", 0),
            TableSpec::new("dataset_event", "timestamp", 0),
            TableSpec::new("import_error", "timestamp", 0),
            TableSpec::new("job", "latest_heartbeat", 0),
            TableSpec::new("log", "dttm", 0),
            TableSpec::new("session", "expiry", 0),
            TableSpec::new("task_fail", "start_date", 0),
            TableSpec::new("task_reschedule", "start_date", 0),
            TableSpec::new("task_instance", "start_date", 1)
                .key_columns(&["dag_id", "task_id", "run_id", "map_index"])
                .referenced_by(&["task_fail", "task_reschedule"]),
            TableSpec::new("dag_run", "start_date", 2).referenced_by(&["task_instance"]),
        ];
        tables.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.name.cmp(&b.name)));
        Self { tables }
    }

    /// The configured table list, or the scheduler default.
    pub fn from_config(config: &RetentionConfig) -> CleanupResult<Self> {
        match &config.tables {
            Some(tables) => Self::new(tables.iter().map(TableSpec::from).collect()),
            None => Ok(Self::scheduler_default()),
        }
    }

    /// Restrict to `names`. Unknown names are skipped with a warning.
    pub fn select(&self, names: &[String]) -> CleanupResult<Self> {
        for name in names {
            if self.get(name).is_none() {
                warn!(table = %name, "Ignoring unknown table name");
            }
        }
        let tables: Vec<TableSpec> = self
            .tables
            .iter()
            .filter(|t| names.iter().any(|n| n == &t.name))
            .cloned()
            .collect();
        if tables.is_empty() {
            return Err(CleanupError::InvalidPolicy(format!(
                "no valid table names selected from [{}]",
                names.join(", ")
            )));
        }
        Ok(Self { tables })
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    pub fn get(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Tables grouped by rank, lowest first.
    pub fn rank_groups(&self) -> Vec<&[TableSpec]> {
        self.tables.chunk_by(|a, b| a.rank == b.rank).collect()
    }
}
