//! Archive storage backends for exported artifacts.
//!
//! Every backend implements [`ArchiveStorage`]:
//!
//! - **Local**: copies into a directory on the local filesystem
//! - **S3** (`aws`): Amazon S3 and S3-compatible services
//! - **GCS** (`gcp`): Google Cloud Storage JSON API
//! - **Azure** (`azure`): Azure Blob Storage REST API
//!
//! The backend is chosen per run by the `provider` option. Remote backends
//! resolve their credentials at construction, before any table is touched.

mod credentials;
#[cfg(any(feature = "gcs-storage", feature = "azure-storage"))]
mod http;
mod local;
mod retry;
#[cfg(any(feature = "gcs-storage", feature = "azure-storage"))]
mod token;

#[cfg(feature = "azure-storage")]
mod azure;
#[cfg(feature = "gcs-storage")]
mod gcs;
#[cfg(feature = "s3-storage")]
mod s3;

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
#[cfg(feature = "azure-storage")]
pub use azure::AzureBlobStorage;
pub use credentials::resolve_connection;
#[cfg(feature = "gcs-storage")]
pub use gcs::GcsStorage;
pub use local::LocalStorage;
pub use retry::{RetriedUpload, upload_with_retry};
#[cfg(feature = "s3-storage")]
pub use s3::S3Storage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncReadExt;
#[cfg(any(feature = "gcs-storage", feature = "azure-storage"))]
pub use token::{BearerTokenSource, StaticToken};
use tracing::info;

use crate::config::ConnectionConfig;

/// Errors that can occur while talking to archive storage.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Rejected by storage service (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Integrity check failed for {key}: {detail}")]
    Integrity { key: String, detail: String },

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl StorageError {
    /// Transient failures that a fresh attempt may fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Upload(_) | StorageError::Timeout(_))
    }

    /// Stable identifier for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Credential(_) => "credential_error",
            StorageError::Upload(_) => "upload_error",
            StorageError::Rejected { .. } => "rejected",
            StorageError::BucketNotFound(_) => "bucket_not_found",
            StorageError::Integrity { .. } => "integrity_error",
            StorageError::Io(_) => "io_error",
            StorageError::Config(_) => "config_error",
            StorageError::Timeout(_) => "timeout",
        }
    }

    /// Map an HTTP error status from a REST storage API.
    #[cfg_attr(
        not(any(
            feature = "s3-storage",
            feature = "gcs-storage",
            feature = "azure-storage",
            test
        )),
        allow(dead_code)
    )]
    pub(crate) fn from_status(status: u16, bucket: &str, message: String) -> Self {
        match status {
            401 | 403 => StorageError::Credential(format!("HTTP {status}: {message}")),
            404 => StorageError::BucketNotFound(bucket.to_string()),
            408 | 429 | 500..=599 => StorageError::Upload(format!("HTTP {status}: {message}")),
            _ => StorageError::Rejected { status, message },
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Where exported artifacts go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    #[default]
    Local,
    Aws,
    Gcp,
    Azure,
}

impl StorageProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageProvider::Local => "local",
            StorageProvider::Aws => "aws",
            StorageProvider::Gcp => "gcp",
            StorageProvider::Azure => "azure",
        }
    }

    pub fn is_remote(&self) -> bool {
        !matches!(self, StorageProvider::Local)
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "local" => Ok(StorageProvider::Local),
            "aws" => Ok(StorageProvider::Aws),
            "gcp" => Ok(StorageProvider::Gcp),
            "azure" => Ok(StorageProvider::Azure),
            other => Err(format!(
                "Provider {other} is not supported. Currently supported providers are aws, gcp, azure and local"
            )),
        }
    }
}

/// A staged file ready to be uploaded.
#[derive(Debug, Clone, Copy)]
pub struct UploadSource<'a> {
    pub path: &'a Path,
    /// SHA-256 hex digest of the file contents.
    pub checksum: &'a str,
    pub size_bytes: u64,
}

/// An object confirmed to exist in archive storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteObject {
    /// Backend-specific location, e.g. `s3://bucket/key` or a local path.
    pub location: String,
    pub size_bytes: u64,
}

/// Trait for archive storage backends.
///
/// Implementations must be `Send + Sync` to support concurrent uploads.
#[async_trait]
pub trait ArchiveStorage: Send + Sync {
    /// Check that the destination exists and is reachable with the
    /// resolved credentials.
    async fn verify_access(&self) -> StorageResult<()>;

    /// Upload `source` under `key` and confirm the stored object matches.
    ///
    /// One attempt; retries are layered on top by [`upload_with_retry`].
    async fn upload(&self, source: UploadSource<'_>, key: &str) -> StorageResult<RemoteObject>;

    /// Get the backend type name (for logging/debugging).
    fn backend_name(&self) -> &'static str;
}

/// Everything needed to construct a backend for one run.
#[derive(Debug, Clone)]
pub struct StorageTarget<'a> {
    pub provider: StorageProvider,
    pub bucket_name: Option<&'a str>,
    /// Staging directory; local archives default to `{output_path}/archive`.
    pub output_path: &'a Path,
    pub connection_id: Option<&'a str>,
    pub env_secret_name: Option<&'a str>,
}

/// Remote object key for an artifact: `{deployment}/{table}/{run_timestamp}.csv`.
pub fn archive_key(deployment: &str, table: &str, run_timestamp: &str, extension: &str) -> String {
    format!("{deployment}/{table}/{run_timestamp}.{extension}")
}

/// Stream a file through SHA-256, returning the hex digest and byte count.
pub async fn file_digest(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// Create an archive storage backend for a run.
///
/// Remote credentials are resolved here, so a missing or malformed
/// credential fails before any table is touched.
pub async fn create_storage(
    target: &StorageTarget<'_>,
    connections: &HashMap<String, ConnectionConfig>,
) -> StorageResult<Arc<dyn ArchiveStorage>> {
    match target.provider {
        StorageProvider::Local => {
            let dest = target
                .bucket_name
                .map(PathBuf::from)
                .unwrap_or_else(|| target.output_path.join("archive"));
            info!(path = %dest.display(), "Using local archive storage backend");
            Ok(Arc::new(LocalStorage::new(dest)))
        }
        remote => {
            let bucket = target.bucket_name.ok_or_else(|| {
                StorageError::Config(format!("bucketName is required for provider {remote}"))
            })?;
            let connection = resolve_connection(
                remote,
                target.connection_id,
                target.env_secret_name,
                connections,
            )?;
            create_remote_storage(connection, bucket).await
        }
    }
}

async fn create_remote_storage(
    connection: ConnectionConfig,
    bucket: &str,
) -> StorageResult<Arc<dyn ArchiveStorage>> {
    match connection {
        #[cfg(feature = "s3-storage")]
        ConnectionConfig::Aws(aws) => {
            info!(bucket, "Using S3 archive storage backend");
            Ok(Arc::new(S3Storage::new(&aws, bucket).await?))
        }
        #[cfg(not(feature = "s3-storage"))]
        ConnectionConfig::Aws(_) => Err(StorageError::Config(
            "S3 archive storage requires the 's3-storage' feature. \
                Rebuild with: cargo build --features s3-storage"
                .to_string(),
        )),
        #[cfg(feature = "gcs-storage")]
        ConnectionConfig::Gcp(gcp) => {
            info!(bucket, "Using GCS archive storage backend");
            Ok(Arc::new(GcsStorage::new(&gcp, bucket).await?))
        }
        #[cfg(not(feature = "gcs-storage"))]
        ConnectionConfig::Gcp(_) => Err(StorageError::Config(
            "GCS archive storage requires the 'gcs-storage' feature. \
                Rebuild with: cargo build --features gcs-storage"
                .to_string(),
        )),
        #[cfg(feature = "azure-storage")]
        ConnectionConfig::Azure(azure) => {
            info!(bucket, account = %azure.account_name, "Using Azure Blob archive storage backend");
            Ok(Arc::new(AzureBlobStorage::new(&azure, bucket)?))
        }
        #[cfg(not(feature = "azure-storage"))]
        ConnectionConfig::Azure(_) => Err(StorageError::Config(
            "Azure Blob archive storage requires the 'azure-storage' feature. \
                Rebuild with: cargo build --features azure-storage"
                .to_string(),
        )),
    }
}
