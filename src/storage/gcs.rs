use std::{collections::HashMap, path::Path, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, future, stream};
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument};
use url::Url;
use uuid::Uuid;

use super::{
    ArchiveStorage, RemoteObject, StorageError, StorageResult, UploadSource,
    http::{build_client, error_for_status, transport_error},
    token::{BearerTokenSource, GcpTokenSource},
};
use crate::config::GcpConnection;

const DEFAULT_GCS_BASE_URL: &str = "https://storage.googleapis.com";
const CHECKSUM_METADATA_KEY: &str = "sha256";

/// Subset of the GCS object resource we read back after an upload.
#[derive(Debug, Deserialize)]
struct ObjectResource {
    /// The JSON API encodes uint64 as a string.
    size: String,
    /// Custom metadata set at upload.
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// Google Cloud Storage archive backend using the JSON API.
///
/// Objects are written with a single-request multipart upload that carries
/// the artifact's SHA-256 as custom metadata, then read back through the
/// metadata endpoint to confirm size and checksum.
pub struct GcsStorage {
    client: reqwest::Client,
    base_url: Url,
    bucket: String,
    tokens: Arc<dyn BearerTokenSource>,
}

impl GcsStorage {
    pub async fn new(connection: &GcpConnection, bucket: &str) -> StorageResult<Self> {
        let tokens = GcpTokenSource::from_credentials(&connection.credentials).await?;
        let base_url = connection
            .endpoint
            .as_deref()
            .unwrap_or(DEFAULT_GCS_BASE_URL);
        Self::with_token_source(base_url, bucket, Arc::new(tokens))
    }

    /// Construct against an explicit API base URL, e.g. an emulator.
    pub fn with_token_source(
        base_url: &str,
        bucket: &str,
        tokens: Arc<dyn BearerTokenSource>,
    ) -> StorageResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| StorageError::Config(format!("invalid GCS endpoint '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(StorageError::Config(format!(
                "invalid GCS endpoint '{base_url}'"
            )));
        }
        Ok(Self {
            client: build_client()?,
            base_url,
            bucket: bucket.to_string(),
            tokens,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // cannot_be_a_base was rejected at construction
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn bucket_url(&self) -> Url {
        self.endpoint(&["storage", "v1", "b", &self.bucket])
    }

    fn object_url(&self, key: &str) -> Url {
        // The whole key is one segment, so '/' is percent-encoded.
        self.endpoint(&["storage", "v1", "b", &self.bucket, "o", key])
    }

    fn upload_url(&self, key: &str) -> Url {
        let mut url = self.endpoint(&["upload", "storage", "v1", "b", &self.bucket, "o"]);
        url.query_pairs_mut()
            .append_pair("uploadType", "multipart");
        url
    }
}

/// A `multipart/related` upload body: object metadata, then the file.
struct MultipartUpload {
    boundary: String,
    head: Vec<u8>,
    tail: Vec<u8>,
}

impl MultipartUpload {
    fn new(key: &str, checksum: &str) -> Self {
        let boundary = format!("dbcleanup-{}", Uuid::new_v4().simple());
        let metadata = serde_json::json!({
            "name": key,
            "contentType": "text/csv",
            "metadata": { CHECKSUM_METADATA_KEY: checksum },
        });
        let head = format!(
            "--{boundary}\r\n\
             Content-Type: application/json; charset=UTF-8\r\n\r\n\
             {metadata}\r\n\
             --{boundary}\r\n\
             Content-Type: text/csv\r\n\r\n"
        );
        let tail = format!("\r\n--{boundary}--\r\n");
        Self {
            boundary,
            head: head.into_bytes(),
            tail: tail.into_bytes(),
        }
    }

    fn content_type(&self) -> String {
        format!("multipart/related; boundary={}", self.boundary)
    }

    fn content_length(&self, file_size: u64) -> u64 {
        self.head.len() as u64 + file_size + self.tail.len() as u64
    }

    /// Stream the parts around the file without buffering it.
    async fn into_body(self, path: &Path) -> StorageResult<reqwest::Body> {
        let file = tokio::fs::File::open(path).await?;
        let parts = stream::once(future::ready(Ok::<_, std::io::Error>(Bytes::from(self.head))))
            .chain(ReaderStream::new(file))
            .chain(stream::once(future::ready(Ok(Bytes::from(self.tail)))));
        Ok(reqwest::Body::wrap_stream(parts))
    }
}

#[async_trait]
impl ArchiveStorage for GcsStorage {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn verify_access(&self) -> StorageResult<()> {
        let response = self
            .client
            .get(self.bucket_url())
            .header(AUTHORIZATION, self.tokens.authorization().await?)
            .send()
            .await
            .map_err(transport_error)?;
        error_for_status(response, &self.bucket).await?;
        debug!("GCS bucket is reachable");
        Ok(())
    }

    #[instrument(skip(self, source), fields(bucket = %self.bucket, size = source.size_bytes))]
    async fn upload(&self, source: UploadSource<'_>, key: &str) -> StorageResult<RemoteObject> {
        let authorization = self.tokens.authorization().await?;
        let upload = MultipartUpload::new(key, source.checksum);

        let response = self
            .client
            .post(self.upload_url(key))
            .header(AUTHORIZATION, &authorization)
            .header(CONTENT_TYPE, upload.content_type())
            .header(CONTENT_LENGTH, upload.content_length(source.size_bytes))
            .body(upload.into_body(source.path).await?)
            .send()
            .await
            .map_err(transport_error)?;
        error_for_status(response, &self.bucket).await?;

        let response = self
            .client
            .get(self.object_url(key))
            .header(AUTHORIZATION, &authorization)
            .send()
            .await
            .map_err(transport_error)?;
        let object: ObjectResource = error_for_status(response, &self.bucket)
            .await?
            .json()
            .await
            .map_err(|e| StorageError::Upload(format!("unreadable object metadata: {e}")))?;

        let stored_size: u64 = object.size.parse().map_err(|_| StorageError::Integrity {
            key: key.to_string(),
            detail: format!("object reports non-numeric size '{}'", object.size),
        })?;
        let stored_checksum = object
            .metadata
            .get(CHECKSUM_METADATA_KEY)
            .map(String::as_str);
        if stored_size != source.size_bytes || stored_checksum != Some(source.checksum) {
            return Err(StorageError::Integrity {
                key: key.to_string(),
                detail: format!(
                    "expected {} bytes with sha256 {}, object has {stored_size} bytes with sha256 {}",
                    source.size_bytes,
                    source.checksum,
                    stored_checksum.unwrap_or("<missing>")
                ),
            });
        }

        info!(key, "Artifact stored in GCS");
        Ok(RemoteObject {
            location: format!("gs://{}/{}", self.bucket, key),
            size_bytes: stored_size,
        })
    }

    fn backend_name(&self) -> &'static str {
        "gcs"
    }
}
