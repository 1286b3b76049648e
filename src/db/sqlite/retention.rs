use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::db::{
    error::DbResult,
    repos::{
        CandidateQuery, CandidateRow, ColumnInfo, DeleteOutcome, DeleteRequest, RetentionRepo,
        RowKey, check_key_arity, key_column_list, next_batch_limit, quote_identifier,
    },
};

pub struct SqliteRetentionRepo {
    pool: SqlitePool,
}

impl SqliteRetentionRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Timestamps are stored as text in whatever format the scheduler
    /// wrote, so comparisons go through `julianday()`, which accepts both
    /// `T` and space separators and an optional zone suffix.
    fn cutoff_param(cutoff: DateTime<Utc>) -> String {
        cutoff.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    }

    fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }
}

#[async_trait]
impl RetentionRepo for SqliteRetentionRepo {
    async fn table_columns(&self, table: &str) -> DbResult<Vec<ColumnInfo>> {
        quote_identifier(table)?;

        let rows = sqlx::query("SELECT name, type FROM pragma_table_info(?) ORDER BY cid")
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: row.try_get("name")?,
                    data_type: row.try_get("type")?,
                })
            })
            .collect()
    }

    async fn fetch_candidates(
        &self,
        query: &CandidateQuery,
        after_key: Option<&RowKey>,
        limit: u32,
    ) -> DbResult<Vec<CandidateRow>> {
        let table = quote_identifier(&query.table)?;
        let ts = quote_identifier(&query.timestamp_column)?;
        let keys = key_column_list(&query.key_columns)?;
        let key_list = keys.join(", ");
        let columns = query
            .columns
            .iter()
            .map(|c| quote_identifier(c).map(|q| format!("CAST({q} AS TEXT)")))
            .collect::<DbResult<Vec<_>>>()?;

        let select_list = keys
            .iter()
            .map(|k| format!("CAST({k} AS TEXT)"))
            .chain(columns)
            .collect::<Vec<_>>()
            .join(", ");
        let key_filter = match after_key {
            Some(after) => {
                check_key_arity(after, &query.key_columns)?;
                format!(" AND ({key_list}) > ({})", Self::placeholders(keys.len()))
            }
            None => String::new(),
        };
        let sql = format!(
            "SELECT {select_list} FROM {table} \
             WHERE julianday({ts}) < julianday(?){key_filter} \
             ORDER BY {key_list} LIMIT ?"
        );

        let mut q = sqlx::query(&sql).bind(Self::cutoff_param(query.cutoff));
        if let Some(after) = after_key {
            for part in after.parts() {
                q = q.bind(part.as_str());
            }
        }
        let rows = q.bind(limit as i64).fetch_all(&self.pool).await?;

        let key_len = keys.len();
        rows.iter()
            .map(|row| {
                let key = (0..key_len)
                    .map(|i| row.try_get::<String, _>(i))
                    .collect::<Result<Vec<_>, _>>()?;
                let values = (key_len..key_len + query.columns.len())
                    .map(|i| row.try_get::<Option<String>, _>(i))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(CandidateRow {
                    key: RowKey::new(key),
                    values,
                })
            })
            .collect()
    }

    async fn delete_candidates(&self, request: &DeleteRequest) -> DbResult<DeleteOutcome> {
        let table = quote_identifier(&request.table)?;
        let ts = quote_identifier(&request.timestamp_column)?;
        let key_list = key_column_list(&request.key_columns)?.join(", ");
        check_key_arity(&request.max_key, &request.key_columns)?;
        let sql = format!(
            "DELETE FROM {table} WHERE ({key_list}) IN ( \
                SELECT {key_list} FROM {table} \
                WHERE julianday({ts}) < julianday(?) AND ({key_list}) <= ({}) \
                ORDER BY {key_list} LIMIT ? \
             )",
            Self::placeholders(request.key_columns.len())
        );
        let cutoff = Self::cutoff_param(request.cutoff);

        let mut outcome = DeleteOutcome::default();
        while let Some(limit) = next_batch_limit(request, outcome.deleted) {
            let mut tx = self.pool.begin().await?;
            let mut q = sqlx::query(&sql).bind(&cutoff);
            for part in request.max_key.parts() {
                q = q.bind(part.as_str());
            }
            let result = q.bind(limit).execute(&mut *tx).await?;
            tx.commit().await?;

            let rows_deleted = result.rows_affected();
            outcome.deleted += rows_deleted;
            request.progress.record(rows_deleted);
            tracing::debug!(
                table = %request.table,
                batch = rows_deleted,
                total = outcome.deleted,
                "Committed delete batch"
            );

            if rows_deleted < limit as u64 {
                outcome.exhausted = true;
                break;
            }
        }

        Ok(outcome)
    }
}
