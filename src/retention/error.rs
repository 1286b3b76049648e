use thiserror::Error;

use crate::{db::DbError, storage::StorageError};

/// Errors that abort a run before any table is touched.
///
/// Failures scoped to a single table are recorded in the run report
/// instead of being returned.
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Export format {0} is not supported. Currently supported format is csv")]
    UnsupportedFormat(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

impl CleanupError {
    /// Stable identifier for reports and exit codes.
    pub fn kind(&self) -> &'static str {
        match self {
            CleanupError::InvalidPolicy(_) => "invalid_policy",
            CleanupError::UnsupportedFormat(_) => "unsupported_format",
            CleanupError::Config(_) => "config_error",
            CleanupError::Storage(e) => e.kind(),
            CleanupError::Database(_) => "database_error",
        }
    }
}

pub type CleanupResult<T> = Result<T, CleanupError>;

/// Errors while writing a table's staging file.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV encoding error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Failed to read candidates: {0}")]
    Database(#[from] DbError),
}

impl ExportError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::Io(_) => "export_io_error",
            ExportError::Csv(_) => "export_encode_error",
            ExportError::Database(_) => "database_error",
        }
    }
}
