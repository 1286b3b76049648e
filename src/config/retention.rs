//! Cleanup engine configuration.
//!
//! Tunes how the retention pipeline pages through candidates, batches
//! deletions, retries uploads, and which tables it walks.
//!
//! # Example
//!
//! ```toml
//! [retention]
//! page_size = 5000
//! delete_batch_size = 1000
//! max_deletes_per_run = 100000
//! concurrency = 4
//!
//! [retention.retry]
//! max_retries = 3
//! initial_delay_ms = 500
//!
//! [[retention.tables]]
//! name = "task_instance"
//! timestamp_column = "start_date"
//! key_column = ["dag_id", "task_id", "run_id", "map_index"]
//! rank = 1
//! referenced_by = ["task_fail"]
//!
//! [retention.schedule]
//! enabled = true
//! interval_hours = 24
//! options = { olderThan = "90", dryRun = "false", provider = "local" }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Retention pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionConfig {
    /// Rows fetched per candidate page (keyset pagination).
    /// Default: 5000
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Rows deleted per transaction.
    /// Default: 1000
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: u32,

    /// Maximum rows deleted per table in a single run. 0 means unlimited.
    /// A capped table is reported as not fully purged, which holds back
    /// the tables it references.
    #[serde(default)]
    pub max_deletes_per_run: u64,

    /// Tables of the same dependency rank processed concurrently.
    /// Default: 4
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Buffer size for staging file writes, in bytes.
    #[serde(default = "default_write_buffer_bytes")]
    pub write_buffer_bytes: usize,

    /// Deadline for a whole run, in seconds.
    /// Default: 3600
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Timeout for a single upload attempt, in seconds.
    /// Default: 300
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Check that the destination bucket is reachable before exporting.
    /// Skipped for dry runs.
    #[serde(default = "default_true")]
    pub verify_bucket: bool,

    /// Deployment name used in remote keys when a run does not supply one.
    #[serde(default = "default_deployment_name")]
    pub default_deployment_name: String,

    /// Upload retry policy.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Tables subject to cleanup. When omitted, the built-in scheduler
    /// metadata registry is used.
    #[serde(default)]
    pub tables: Option<Vec<TableConfig>>,

    /// Periodic execution for `dbcleanup worker`.
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            delete_batch_size: default_delete_batch_size(),
            max_deletes_per_run: 0,
            concurrency: default_concurrency(),
            write_buffer_bytes: default_write_buffer_bytes(),
            run_timeout_secs: default_run_timeout_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            verify_bucket: true,
            default_deployment_name: default_deployment_name(),
            retry: RetryConfig::default(),
            tables: None,
            schedule: ScheduleConfig::default(),
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 {
            return Err(ConfigError::Validation(
                "retention.page_size must be greater than 0".into(),
            ));
        }
        if self.delete_batch_size == 0 {
            return Err(ConfigError::Validation(
                "retention.delete_batch_size must be greater than 0".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Validation(
                "retention.concurrency must be greater than 0".into(),
            ));
        }
        if self.run_timeout_secs == 0 || self.attempt_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "retention timeouts must be greater than 0".into(),
            ));
        }
        if self.default_deployment_name.is_empty() {
            return Err(ConfigError::Validation(
                "retention.default_deployment_name cannot be empty".into(),
            ));
        }
        if let Some(tables) = &self.tables
            && tables.is_empty()
        {
            return Err(ConfigError::Validation(
                "retention.tables is set but lists no tables".into(),
            ));
        }
        self.retry.validate()?;
        self.schedule.validate()?;
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Per-table deletion cap, `None` when unlimited.
    pub fn delete_cap(&self) -> Option<u64> {
        (self.max_deletes_per_run > 0).then_some(self.max_deletes_per_run)
    }
}

fn default_page_size() -> u32 {
    5000
}

fn default_delete_batch_size() -> u32 {
    1000
}

fn default_concurrency() -> usize {
    4
}

fn default_write_buffer_bytes() -> usize {
    64 * 1024
}

fn default_run_timeout_secs() -> u64 {
    3600
}

fn default_attempt_timeout_secs() -> u64 {
    300
}

fn default_deployment_name() -> String {
    "airflow".to_string()
}

fn default_true() -> bool {
    true
}

/// A table declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TableConfig {
    pub name: String,

    /// Column compared against the cutoff.
    pub timestamp_column: String,

    /// Unique, orderable column used for paging and deletion. A list
    /// names the columns of a composite key in index order.
    #[serde(default)]
    pub key_column: KeyColumns,

    /// Dependency rank. Lower ranks are purged first.
    #[serde(default)]
    pub rank: u32,

    /// Tables holding references into this one. Each must have a lower rank.
    #[serde(default)]
    pub referenced_by: Vec<String>,
}

/// A key column, or the columns of a composite key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum KeyColumns {
    Single(String),
    Composite(Vec<String>),
}

impl Default for KeyColumns {
    fn default() -> Self {
        KeyColumns::Single("id".to_string())
    }
}

impl KeyColumns {
    pub fn names(&self) -> Vec<String> {
        match self {
            KeyColumns::Single(name) => vec![name.clone()],
            KeyColumns::Composite(names) => names.clone(),
        }
    }
}

impl From<&str> for KeyColumns {
    fn from(name: &str) -> Self {
        KeyColumns::Single(name.to_string())
    }
}

/// Retry configuration for archive uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay before first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (percentage, 0.0-1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Validation(
                "retention.retry.jitter must be between 0.0 and 1.0".into(),
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "retention.retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Calculate the delay for a given retry attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay =
            (self.initial_delay_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        let jitter_range = capped_delay * self.jitter;
        let jitter = if jitter_range > 0.0 {
            use rand::Rng;
            rand::thread_rng().gen_range(-jitter_range..jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped_delay + jitter).max(0.0) as u64)
    }
}

fn default_max_retries() -> u32 {
    2
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

/// Periodic cleanup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Whether the worker loop runs at all.
    #[serde(default)]
    pub enabled: bool,

    /// How often to run, in hours.
    /// Default: 24 (once per day)
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,

    /// Run options, in the same string form a trigger would pass.
    #[serde(default)]
    pub options: std::collections::BTreeMap<String, String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: default_interval_hours(),
            options: Default::default(),
        }
    }
}

impl ScheduleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.enabled {
            return Ok(());
        }
        if self.interval_hours == 0 {
            return Err(ConfigError::Validation(
                "retention.schedule.interval_hours must be greater than 0".into(),
            ));
        }
        if !self.options.contains_key("olderThan") {
            return Err(ConfigError::Validation(
                "retention.schedule.options must set olderThan".into(),
            ));
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }
}

fn default_interval_hours() -> u64 {
    24
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RetentionConfig::default();
        assert_eq!(config.page_size, 5000);
        assert_eq!(config.delete_batch_size, 1000);
        assert_eq!(config.delete_cap(), None);
        assert!(config.verify_bucket);
        assert_eq!(config.default_deployment_name, "airflow");
        assert!(config.tables.is_none());
        assert!(!config.schedule.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
            page_size = 100
            max_deletes_per_run = 50000

            [retry]
            max_retries = 5
            jitter = 0.0

            [[tables]]
            name = "task_instance"
            timestamp_column = "start_date"
            rank = 1
            referenced_by = ["task_fail"]

            [[tables]]
            name = "task_fail"
            timestamp_column = "start_date"

            [schedule]
            enabled = true
            interval_hours = 12
            options = { olderThan = "30", dryRun = "false" }
        "#;

        let config: RetentionConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.page_size, 100);
        assert_eq!(config.delete_cap(), Some(50000));
        assert_eq!(config.retry.max_attempts(), 6);

        let tables = config.tables.as_ref().unwrap();
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[0].key_column.names(), vec!["id".to_string()]);
        assert_eq!(tables[0].referenced_by, vec!["task_fail".to_string()]);
        assert_eq!(tables[1].rank, 0);

        assert_eq!(config.schedule.interval(), Duration::from_secs(12 * 3600));
        assert_eq!(config.schedule.options["olderThan"], "30");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_composite_key_column() {
        let toml = r#"
            [[tables]]
            name = "task_instance"
            timestamp_column = "start_date"
            key_column = ["dag_id", "task_id", "run_id", "map_index"]

            [[tables]]
            name = "audit"
            timestamp_column = "created_at"
            key_column = "audit_id"
        "#;

        let config: RetentionConfig = toml::from_str(toml).unwrap();
        let tables = config.tables.unwrap();
        assert_eq!(
            tables[0].key_column.names(),
            vec!["dag_id", "task_id", "run_id", "map_index"]
        );
        assert_eq!(tables[1].key_column, KeyColumns::Single("audit_id".into()));
    }

    #[test]
    fn test_zero_page_size_rejected() {
        let config: RetentionConfig = toml::from_str("page_size = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_schedule_requires_older_than() {
        let config: RetentionConfig = toml::from_str(
            r#"
            [schedule]
            enabled = true
        "#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("olderThan"));
    }

    #[test]
    fn test_delay_without_jitter_is_exponential_and_capped() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(350));
    }

    #[test]
    fn test_delay_with_jitter_stays_in_range() {
        let retry = RetryConfig {
            jitter: 0.5,
            ..RetryConfig::default()
        };
        for _ in 0..20 {
            let delay = retry.delay_for_attempt(0).as_millis();
            assert!((250..=750).contains(&delay), "delay out of range: {delay}");
        }
    }
}
