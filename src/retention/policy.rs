//! Run options and the retention policy derived from them.

use std::{fmt, path::PathBuf, str::FromStr, sync::LazyLock};

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::{CleanupError, CleanupResult};
use crate::{
    config::RetentionConfig,
    storage::{StorageProvider, StorageTarget},
};

static DEPLOYMENT_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());

const DEFAULT_OUTPUT_PATH: &str = "/tmp";

/// Format of exported artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ExportFormat {
    type Err = CleanupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            _ => Err(CleanupError::UnsupportedFormat(s.to_string())),
        }
    }
}

/// Options for one cleanup run, as a trigger supplies them.
///
/// Every field is optional at this level; [`CleanupOptions::resolve`]
/// applies defaults and rejects what is missing or malformed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CleanupOptions {
    /// Retention threshold in days. Required.
    #[serde(default)]
    pub older_than: Option<i64>,

    /// Defaults to true.
    #[serde(default)]
    pub dry_run: Option<bool>,

    #[serde(default)]
    pub export_format: Option<String>,

    /// Staging directory. Defaults to `/tmp`.
    #[serde(default)]
    pub output_path: Option<PathBuf>,

    #[serde(default)]
    pub provider: Option<String>,

    #[serde(default)]
    pub connection_id: Option<String>,

    #[serde(default)]
    pub provider_env_secret_name: Option<String>,

    #[serde(default)]
    pub bucket_name: Option<String>,

    /// Only purge tables whose export was uploaded. Defaults to false.
    #[serde(default)]
    pub purge_table: Option<bool>,

    #[serde(default)]
    pub deployment_name: Option<String>,

    #[serde(default)]
    pub table_names: Option<Vec<String>>,
}

impl CleanupOptions {
    /// Build options from raw string parameters.
    ///
    /// Empty values count as absent. Unknown keys are ignored with a warning.
    pub fn from_pairs<I, K, V>(pairs: I) -> CleanupResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut options = CleanupOptions::default();

        for (key, value) in pairs {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            if value.is_empty() {
                continue;
            }
            match key {
                "olderThan" => {
                    let days = value.parse::<i64>().map_err(|_| {
                        CleanupError::InvalidPolicy(format!(
                            "olderThan must be a whole number of days, got \"{value}\""
                        ))
                    })?;
                    options.older_than = Some(days);
                }
                "dryRun" => options.dry_run = Some(parse_bool(key, value)?),
                "purgeTable" => options.purge_table = Some(parse_bool(key, value)?),
                "exportFormat" => options.export_format = Some(value.to_string()),
                "outputPath" => options.output_path = Some(PathBuf::from(value)),
                "provider" => options.provider = Some(value.to_string()),
                "connectionId" => options.connection_id = Some(value.to_string()),
                "providerEnvSecretName" => {
                    options.provider_env_secret_name = Some(value.to_string())
                }
                "bucketName" => options.bucket_name = Some(value.to_string()),
                "deploymentName" => options.deployment_name = Some(value.to_string()),
                "tableNames" => {
                    let names: Vec<String> = value
                        .split(',')
                        .map(str::trim)
                        .filter(|name| !name.is_empty())
                        .map(str::to_string)
                        .collect();
                    if !names.is_empty() {
                        options.table_names = Some(names);
                    }
                }
                other => tracing::warn!(option = other, "Ignoring unknown cleanup option"),
            }
        }

        Ok(options)
    }

    /// Validate the options and fix the policy for a run starting at
    /// `reference_time`.
    pub fn resolve(
        &self,
        config: &RetentionConfig,
        reference_time: DateTime<Utc>,
    ) -> CleanupResult<RunSettings> {
        let older_than = self
            .older_than
            .ok_or_else(|| CleanupError::InvalidPolicy("olderThan is required".into()))?;

        let export_format = match non_empty(&self.export_format) {
            Some(format) => format.parse()?,
            None => ExportFormat::default(),
        };

        let policy = RetentionPolicy::new(
            older_than,
            self.dry_run.unwrap_or(true),
            self.purge_table.unwrap_or(false),
            export_format,
            reference_time,
        )?;

        let provider = match non_empty(&self.provider) {
            Some(p) => p.parse::<StorageProvider>().map_err(CleanupError::InvalidPolicy)?,
            None => StorageProvider::default(),
        };

        let bucket_name = non_empty(&self.bucket_name).map(str::to_string);
        if provider.is_remote() && bucket_name.is_none() {
            return Err(CleanupError::InvalidPolicy(format!(
                "bucketName is required for provider {provider}"
            )));
        }

        let deployment_name = non_empty(&self.deployment_name)
            .unwrap_or(&config.default_deployment_name)
            .to_string();
        if !is_valid_deployment_name(&deployment_name) {
            return Err(CleanupError::InvalidPolicy(format!(
                "deploymentName \"{deployment_name}\" must be a single path segment of letters, digits, '.', '_' or '-'"
            )));
        }

        Ok(RunSettings {
            policy,
            provider,
            output_path: self
                .output_path
                .clone()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_PATH)),
            bucket_name,
            connection_id: non_empty(&self.connection_id).map(str::to_string),
            env_secret_name: non_empty(&self.provider_env_secret_name).map(str::to_string),
            deployment_name,
            table_names: self.table_names.clone(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Booleans in the forms a trigger passes them: `t/true/1`, `f/false/0`.
fn parse_bool(key: &str, value: &str) -> CleanupResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "1" => Ok(true),
        "f" | "false" | "0" => Ok(false),
        _ => Err(CleanupError::InvalidPolicy(format!(
            "{key} must be a boolean, got \"{value}\""
        ))),
    }
}

fn is_valid_deployment_name(name: &str) -> bool {
    name != "." && name != ".." && DEPLOYMENT_NAME_REGEX.is_match(name)
}

/// Cutoff and toggles for one run. Fixed at run start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionPolicy {
    older_than_days: u32,
    dry_run: bool,
    purge_after_export: bool,
    export_format: ExportFormat,
    reference_time: DateTime<Utc>,
    cutoff: DateTime<Utc>,
}

impl RetentionPolicy {
    pub fn new(
        older_than_days: i64,
        dry_run: bool,
        purge_after_export: bool,
        export_format: ExportFormat,
        reference_time: DateTime<Utc>,
    ) -> CleanupResult<Self> {
        let days = u32::try_from(older_than_days).map_err(|_| {
            CleanupError::InvalidPolicy(format!(
                "olderThan must be a non-negative number of days, got {older_than_days}"
            ))
        })?;
        let cutoff = TimeDelta::try_days(days.into())
            .and_then(|delta| reference_time.checked_sub_signed(delta))
            .ok_or_else(|| {
                CleanupError::InvalidPolicy(format!("olderThan={days} is out of range"))
            })?;

        Ok(Self {
            older_than_days: days,
            dry_run,
            purge_after_export,
            export_format,
            reference_time,
            cutoff,
        })
    }

    pub fn older_than_days(&self) -> u32 {
        self.older_than_days
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn purge_after_export(&self) -> bool {
        self.purge_after_export
    }

    pub fn export_format(&self) -> ExportFormat {
        self.export_format
    }

    pub fn reference_time(&self) -> DateTime<Utc> {
        self.reference_time
    }

    pub fn cutoff(&self) -> DateTime<Utc> {
        self.cutoff
    }

    /// Strictly older than the cutoff.
    pub fn is_candidate(&self, row_timestamp: DateTime<Utc>) -> bool {
        row_timestamp < self.cutoff
    }

    /// Compact UTC form of the reference time used in artifact names.
    pub fn run_timestamp(&self) -> String {
        self.reference_time.format("%Y%m%dT%H%M%SZ").to_string()
    }
}

/// Everything a run needs beyond the database and configuration.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub policy: RetentionPolicy,
    pub provider: StorageProvider,
    pub output_path: PathBuf,
    pub bucket_name: Option<String>,
    pub connection_id: Option<String>,
    pub env_secret_name: Option<String>,
    pub deployment_name: String,
    /// Restrict the run to these tables.
    pub table_names: Option<Vec<String>>,
}

impl RunSettings {
    pub fn storage_target(&self) -> StorageTarget<'_> {
        StorageTarget {
            provider: self.provider,
            bucket_name: self.bucket_name.as_deref(),
            output_path: &self.output_path,
            connection_id: self.connection_id.as_deref(),
            env_secret_name: self.env_secret_name.as_deref(),
        }
    }
}
