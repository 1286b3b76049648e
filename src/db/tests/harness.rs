//! Test harness for retention tests.

use std::ops::Range;

use sqlx::SqlitePool;

/// Tables of the built-in registry with their timestamp column and a few
/// payload columns. Payload columns are nullable so rows can be seeded
/// with just a key and a timestamp. Every table but `task_instance` is
/// keyed by `id`.
pub const SCHEDULER_TABLES: &[(&str, &str, &str)] = &[
    ("callback_request", "created_at", "callback_data TEXT, priority_weight INTEGER"),
    ("dataset_event", "timestamp", "dataset_id INTEGER, extra TEXT"),
    ("import_error", "timestamp", "filename TEXT, stacktrace TEXT"),
    ("job", "latest_heartbeat", "dag_id TEXT, state TEXT, job_type TEXT"),
    ("log", "dttm", "dag_id TEXT, task_id TEXT, event TEXT"),
    ("session", "expiry", "session_id TEXT, data BLOB"),
    ("task_fail", "start_date", "task_instance_id INTEGER, duration INTEGER"),
    ("task_reschedule", "start_date", "task_instance_id INTEGER, reschedule_date TEXT"),
    ("task_instance", "start_date", "state TEXT, try_number INTEGER"),
    ("dag_run", "start_date", "dag_id TEXT, run_id TEXT, state TEXT"),
];

/// Create an in-memory SQLite pool for testing
pub async fn create_sqlite_pool() -> SqlitePool {
    sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool")
}

/// Composite primary key of `task_instance`. Seeded rows vary only in
/// `map_index`, which takes the seed id.
pub const TASK_INSTANCE_KEY: &[&str] = &["dag_id", "task_id", "run_id", "map_index"];

/// Create every scheduler table used by the default registry.
pub async fn create_scheduler_schema(pool: &SqlitePool) {
    for (table, ts_column, payload) in SCHEDULER_TABLES {
        let sql = if *table == "task_instance" {
            format!(
                "CREATE TABLE {table} (dag_id TEXT NOT NULL, task_id TEXT NOT NULL, \
                 run_id TEXT NOT NULL, map_index INTEGER NOT NULL, {ts_column} TEXT, \
                 {payload}, PRIMARY KEY ({}))",
                TASK_INSTANCE_KEY.join(", ")
            )
        } else {
            format!("CREATE TABLE {table} (id INTEGER PRIMARY KEY, {ts_column} TEXT, {payload})")
        };
        sqlx::query(&sql)
            .execute(pool)
            .await
            .unwrap_or_else(|e| panic!("Failed to create {table}: {e}"));
    }
}

/// Pool with the full scheduler schema in place.
pub async fn scheduler_pool() -> SqlitePool {
    let pool = create_sqlite_pool().await;
    create_scheduler_schema(&pool).await;
    pool
}

fn timestamp_column(table: &str) -> &'static str {
    SCHEDULER_TABLES
        .iter()
        .find(|(name, _, _)| *name == table)
        .map(|(_, ts, _)| *ts)
        .unwrap_or_else(|| panic!("{table} is not a scheduler table"))
}

/// Insert rows with the given ids, all stamped with `timestamp`.
pub async fn seed_rows(pool: &SqlitePool, table: &str, ids: Range<i64>, timestamp: &str) {
    let sql = if table == "task_instance" {
        format!(
            "INSERT INTO {table} (dag_id, task_id, run_id, map_index, {}) \
             VALUES ('etl', 'extract', 'scheduled', ?, ?)",
            timestamp_column(table)
        )
    } else {
        format!(
            "INSERT INTO {table} (id, {}) VALUES (?, ?)",
            timestamp_column(table)
        )
    };
    let mut tx = pool.begin().await.expect("Failed to begin seed transaction");
    for id in ids {
        sqlx::query(&sql)
            .bind(id)
            .bind(timestamp)
            .execute(&mut *tx)
            .await
            .unwrap_or_else(|e| panic!("Failed to seed {table}: {e}"));
    }
    tx.commit().await.expect("Failed to commit seed transaction");
}

/// Number of rows currently in `table`.
pub async fn count_rows(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
        .fetch_one(pool)
        .await
        .unwrap_or_else(|e| panic!("Failed to count {table}: {e}"))
}
