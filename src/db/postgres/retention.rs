use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::db::{
    error::DbResult,
    repos::{
        CandidateQuery, CandidateRow, ColumnInfo, DeleteOutcome, DeleteRequest, RetentionRepo,
        RowKey, check_key_arity, key_column_list, next_batch_limit, quote_identifier,
    },
};

pub struct PostgresRetentionRepo {
    pool: PgPool,
    schema: String,
}

impl PostgresRetentionRepo {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn qualified_table(&self, table: &str) -> DbResult<String> {
        Ok(format!(
            "{}.{}",
            quote_identifier(&self.schema)?,
            quote_identifier(table)?
        ))
    }

    /// Keys travel as text; cast the bound value back to the column's type
    /// so comparisons use the column's ordering and its index.
    fn key_cast(key_type: &str) -> DbResult<String> {
        quote_identifier(key_type)?;
        Ok(key_type.to_string())
    }

    /// `CAST($n AS type), ...` for each key column, numbered from `first`.
    fn key_params(key_columns: &[ColumnInfo], first: usize) -> DbResult<String> {
        key_columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Self::key_cast(&c.data_type).map(|t| format!("CAST(${} AS {t})", first + i))
            })
            .collect::<DbResult<Vec<_>>>()
            .map(|params| params.join(", "))
    }
}

#[async_trait]
impl RetentionRepo for PostgresRetentionRepo {
    async fn table_columns(&self, table: &str) -> DbResult<Vec<ColumnInfo>> {
        quote_identifier(table)?;

        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS name, udt_name::text AS data_type
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ColumnInfo {
                    name: row.try_get("name")?,
                    data_type: row.try_get("data_type")?,
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
        let table = self.qualified_table(&query.table)?;
        let ts = quote_identifier(&query.timestamp_column)?;
        let keys = key_column_list(&query.key_columns)?;
        let key_list = keys.join(", ");
        let columns = query
            .columns
            .iter()
            .map(|c| quote_identifier(c).map(|q| format!("{q}::text")))
            .collect::<DbResult<Vec<_>>>()?;

        let select_list = keys
            .iter()
            .map(|k| format!("{k}::text"))
            .chain(columns)
            .collect::<Vec<_>>()
            .join(", ");

        // $1 is the cutoff; key parts follow, then the limit.
        let (key_filter, limit_param) = match after_key {
            Some(after) => {
                check_key_arity(after, &query.key_columns)?;
                let bound = Self::key_params(&query.key_columns, 2)?;
                (
                    format!(" AND ({key_list}) > ({bound})"),
                    keys.len() + 2,
                )
            }
            None => (String::new(), 2),
        };
        let sql = format!(
            "SELECT {select_list} FROM {table} \
             WHERE {ts} < $1{key_filter} \
             ORDER BY {key_list} LIMIT ${limit_param}"
        );

        let mut q = sqlx::query(&sql).bind(query.cutoff);
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
        let table = self.qualified_table(&request.table)?;
        let ts = quote_identifier(&request.timestamp_column)?;
        let key_list = key_column_list(&request.key_columns)?.join(", ");
        check_key_arity(&request.max_key, &request.key_columns)?;
        let bound = Self::key_params(&request.key_columns, 2)?;
        let limit_param = request.key_columns.len() + 2;
        let sql = format!(
            "DELETE FROM {table} WHERE ({key_list}) IN ( \
                SELECT {key_list} FROM {table} \
                WHERE {ts} < $1 AND ({key_list}) <= ({bound}) \
                ORDER BY {key_list} LIMIT ${limit_param} \
             )"
        );

        let mut outcome = DeleteOutcome::default();
        while let Some(limit) = next_batch_limit(request, outcome.deleted) {
            let mut tx = self.pool.begin().await?;
            let mut q = sqlx::query(&sql).bind(request.cutoff);
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
