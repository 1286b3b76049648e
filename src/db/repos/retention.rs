use std::{
    fmt,
    sync::{
        Arc, LazyLock,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::db::error::{DbError, DbResult};

static IDENTIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Returns true if `name` can be interpolated into SQL as a quoted identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_REGEX.is_match(name)
}

/// Double-quote a validated identifier.
pub fn quote_identifier(name: &str) -> DbResult<String> {
    if !is_valid_identifier(name) {
        return Err(DbError::Validation(format!(
            "'{name}' is not a valid SQL identifier"
        )));
    }
    Ok(format!("\"{name}\""))
}

/// A column of a live table, in declared order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    /// Backend type name (e.g. `INTEGER`, `int8`, `uuid`). Used to cast
    /// textual keys back for comparisons.
    pub data_type: String,
}

/// Key of one row, rendered as text, one part per key column.
///
/// Keys compare as SQL row values, so a composite key orders by its first
/// column, then its second, and so on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowKey(Vec<String>);

impl RowKey {
    pub fn new(parts: Vec<String>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for RowKey {
    fn from(key: &str) -> Self {
        Self(vec![key.to_string()])
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

/// Candidate selection for one table.
#[derive(Debug, Clone)]
pub struct CandidateQuery {
    pub table: String,
    pub timestamp_column: String,
    /// Key columns with the types reported by
    /// [`RetentionRepo::table_columns`]. Never empty.
    pub key_columns: Vec<ColumnInfo>,
    /// Columns to read, in output order.
    pub columns: Vec<String>,
    /// Rows with `timestamp_column < cutoff` are candidates.
    pub cutoff: DateTime<Utc>,
}

/// One candidate row. Values are rendered as text, `None` for SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateRow {
    pub key: RowKey,
    pub values: Vec<Option<String>>,
}

/// Running total of rows deleted by a purge, updated after each commit.
///
/// Clones share the count, so a caller can read how far a purge got even
/// if its future is dropped mid-flight.
#[derive(Debug, Clone, Default)]
pub struct DeleteProgress(Arc<AtomicU64>);

impl DeleteProgress {
    pub fn record(&self, rows: u64) {
        self.0.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn deleted(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Bounds for a batched purge.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub table: String,
    pub timestamp_column: String,
    pub key_columns: Vec<ColumnInfo>,
    pub cutoff: DateTime<Utc>,
    /// Only rows with a key `<= max_key` are removed.
    pub max_key: RowKey,
    pub batch_size: u32,
    /// Stop after this many rows; `None` for no limit.
    pub max_deletes: Option<u64>,
    pub progress: DeleteProgress,
}

/// Result of a batched purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: u64,
    /// True when the last batch came back short, meaning no matching rows
    /// were left. False when the cap stopped the loop first.
    pub exhausted: bool,
}

/// Read and purge access to the tables under retention.
///
/// Implementations build SQL from identifiers, so every identifier is
/// validated with [`quote_identifier`] before use.
#[async_trait]
pub trait RetentionRepo: Send + Sync {
    /// Columns of `table` in declared order. Empty if the table doesn't exist.
    async fn table_columns(&self, table: &str) -> DbResult<Vec<ColumnInfo>>;

    /// Fetch up to `limit` candidates ordered by key, strictly after `after_key`.
    async fn fetch_candidates(
        &self,
        query: &CandidateQuery,
        after_key: Option<&RowKey>,
        limit: u32,
    ) -> DbResult<Vec<CandidateRow>>;

    /// Delete candidates in key order, one transaction per batch.
    ///
    /// Batches already committed stay deleted if a later batch fails, and
    /// each one is added to `request.progress` as soon as it commits.
    async fn delete_candidates(&self, request: &DeleteRequest) -> DbResult<DeleteOutcome>;
}

/// Quoted key columns joined for use as a SQL row value.
pub(crate) fn key_column_list(key_columns: &[ColumnInfo]) -> DbResult<Vec<String>> {
    if key_columns.is_empty() {
        return Err(DbError::Validation("no key columns given".into()));
    }
    key_columns
        .iter()
        .map(|c| quote_identifier(&c.name))
        .collect()
}

/// Check that `key` has one part per key column.
pub(crate) fn check_key_arity(key: &RowKey, key_columns: &[ColumnInfo]) -> DbResult<()> {
    if key.parts().len() != key_columns.len() {
        return Err(DbError::Validation(format!(
            "key {key} has {} parts, expected {}",
            key.parts().len(),
            key_columns.len()
        )));
    }
    Ok(())
}

/// Rows to request for the next delete batch, or `None` once the cap is reached.
pub(crate) fn next_batch_limit(request: &DeleteRequest, deleted_so_far: u64) -> Option<i64> {
    let remaining = match request.max_deletes {
        Some(max) if deleted_so_far >= max => return None,
        Some(max) => max - deleted_so_far,
        None => u64::MAX,
    };
    Some(std::cmp::min(request.batch_size as u64, remaining) as i64)
}
