use async_trait::async_trait;
use aws_sdk_s3::{
    config::http::HttpResponse,
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
};
use tracing::{debug, error, info, instrument};

use super::{ArchiveStorage, RemoteObject, StorageError, StorageResult, UploadSource};
use crate::config::AwsConnection;

/// Metadata key carrying the artifact's SHA-256 digest.
const CHECKSUM_METADATA_KEY: &str = "sha256";

/// Region used when only a custom endpoint is configured.
const FALLBACK_REGION: &str = "us-east-1";

/// Amazon S3 and S3-compatible archive backend.
///
/// Credentials always come from the resolved connection; the ambient AWS
/// credential chain is never consulted.
pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Storage {
    pub async fn new(connection: &AwsConnection, bucket: &str) -> StorageResult<Self> {
        connection.validate().map_err(StorageError::Credential)?;

        let region = connection
            .region
            .clone()
            .unwrap_or_else(|| FALLBACK_REGION.to_string());

        let credentials = aws_credential_types::Credentials::new(
            connection.access_key_id.clone(),
            connection.secret_access_key.clone(),
            connection.session_token.clone(),
            None,
            "dbcleanup-connection",
        );

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region))
            .credentials_provider(credentials)
            .load()
            .await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &connection.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }
        if connection.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config_builder.build()),
            bucket: bucket.to_string(),
        })
    }

    fn classify<E>(&self, err: SdkError<E, HttpResponse>) -> StorageError
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let message = DisplayErrorContext(&err).to_string();
        match &err {
            SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => {
                StorageError::Upload(message)
            }
            SdkError::ConstructionFailure(_) => StorageError::Config(message),
            _ => match err.raw_response().map(|r| r.status().as_u16()) {
                Some(status) => StorageError::from_status(status, &self.bucket, message),
                None => StorageError::Upload(message),
            },
        }
    }
}

#[async_trait]
impl ArchiveStorage for S3Storage {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn verify_access(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| self.classify(e))?;
        debug!("S3 bucket is reachable");
        Ok(())
    }

    #[instrument(skip(self, source), fields(bucket = %self.bucket, size = source.size_bytes))]
    async fn upload(&self, source: UploadSource<'_>, key: &str) -> StorageResult<RemoteObject> {
        let body = ByteStream::from_path(source.path)
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_length(source.size_bytes as i64)
            .content_type("text/csv")
            .metadata(CHECKSUM_METADATA_KEY, source.checksum)
            .send()
            .await
            .map_err(|e| {
                error!(error = %DisplayErrorContext(&e), "Failed to upload to S3");
                self.classify(e)
            })?;

        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let stored_size = head.content_length().unwrap_or_default();
        let stored_checksum = head
            .metadata()
            .and_then(|m| m.get(CHECKSUM_METADATA_KEY))
            .map(String::as_str);

        if stored_size != source.size_bytes as i64 || stored_checksum != Some(source.checksum) {
            return Err(StorageError::Integrity {
                key: key.to_string(),
                detail: format!(
                    "expected {} bytes with sha256 {}, object has {} bytes with sha256 {}",
                    source.size_bytes,
                    source.checksum,
                    stored_size,
                    stored_checksum.unwrap_or("<missing>")
                ),
            });
        }

        info!(key, "Artifact stored in S3");
        Ok(RemoteObject {
            location: format!("s3://{}/{}", self.bucket, key),
            size_bytes: source.size_bytes,
        })
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> AwsConnection {
        AwsConnection {
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            session_token: None,
            region: None,
            endpoint: Some("http://127.0.0.1:9".into()),
            force_path_style: true,
        }
    }

    #[tokio::test]
    async fn test_new_with_endpoint_only() {
        let storage = S3Storage::new(&connection(), "archive").await.unwrap();
        assert_eq!(storage.backend_name(), "s3");
        assert_eq!(storage.bucket, "archive");
    }

    #[tokio::test]
    async fn test_new_rejects_incomplete_connection() {
        let mut conn = connection();
        conn.secret_access_key = String::new();
        let result = S3Storage::new(&conn, "archive").await;
        assert!(matches!(result, Err(StorageError::Credential(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_retryable() {
        let storage = S3Storage::new(&connection(), "archive").await.unwrap();
        let err = storage.verify_access().await.unwrap_err();
        assert!(err.is_retryable(), "{err}");
    }
}
