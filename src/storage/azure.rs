use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use tracing::{debug, info, instrument};
use url::Url;

use super::{
    ArchiveStorage, RemoteObject, StorageError, StorageResult, UploadSource,
    http::{build_client, error_for_status, file_body, transport_error},
    token::{AzureTokenSource, BearerTokenSource},
};
use crate::config::{AzureBlobAuth, AzureConnection};

const API_VERSION: &str = "2021-08-06";
const CHECKSUM_HEADER: &str = "x-ms-meta-sha256";

enum BlobAuth {
    /// Query string appended to every request.
    Sas(String),
    Bearer(Arc<dyn BearerTokenSource>),
}

/// Azure Blob Storage archive backend using the Blob service REST API.
///
/// Each artifact is written as a single block blob tagged with its SHA-256
/// digest, then read back with a properties request.
pub struct AzureBlobStorage {
    client: reqwest::Client,
    service_url: Url,
    container: String,
    auth: BlobAuth,
}

impl AzureBlobStorage {
    pub fn new(connection: &AzureConnection, container: &str) -> StorageResult<Self> {
        connection.validate().map_err(StorageError::Credential)?;

        let auth = match &connection.auth {
            AzureBlobAuth::SasToken { sas_token } => {
                BlobAuth::Sas(sas_token.trim_start_matches('?').to_string())
            }
            AzureBlobAuth::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => BlobAuth::Bearer(Arc::new(AzureTokenSource::from_client_secret(
                tenant_id,
                client_id,
                client_secret,
            )?)),
            AzureBlobAuth::ManagedIdentity { client_id } => BlobAuth::Bearer(Arc::new(
                AzureTokenSource::from_managed_identity(client_id.as_deref())?,
            )),
        };

        Self::build(&connection.service_url(), container, auth)
    }

    /// Authenticate with a SAS token against an explicit service URL.
    pub fn with_sas_token(
        service_url: &str,
        container: &str,
        sas_token: &str,
    ) -> StorageResult<Self> {
        Self::build(
            service_url,
            container,
            BlobAuth::Sas(sas_token.trim_start_matches('?').to_string()),
        )
    }

    /// Authenticate with bearer tokens against an explicit service URL.
    pub fn with_token_source(
        service_url: &str,
        container: &str,
        tokens: Arc<dyn BearerTokenSource>,
    ) -> StorageResult<Self> {
        Self::build(service_url, container, BlobAuth::Bearer(tokens))
    }

    fn build(service_url: &str, container: &str, auth: BlobAuth) -> StorageResult<Self> {
        let parsed = Url::parse(service_url).map_err(|e| {
            StorageError::Config(format!("invalid Azure blob endpoint '{service_url}': {e}"))
        })?;
        if parsed.cannot_be_a_base() {
            return Err(StorageError::Config(format!(
                "invalid Azure blob endpoint '{service_url}'"
            )));
        }
        Ok(Self {
            client: build_client()?,
            service_url: parsed,
            container: container.to_string(),
            auth,
        })
    }

    fn container_url(&self) -> Url {
        let mut url = self.service_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(&self.container);
        }
        url.query_pairs_mut().append_pair("restype", "container");
        self.with_sas(url)
    }

    fn blob_url(&self, key: &str) -> Url {
        let mut url = self.service_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty()
                .push(&self.container)
                .extend(key.split('/'));
        }
        self.with_sas(url)
    }

    fn with_sas(&self, mut url: Url) -> Url {
        if let BlobAuth::Sas(sas) = &self.auth {
            let query = match url.query() {
                Some(existing) if !existing.is_empty() => format!("{existing}&{sas}"),
                _ => sas.clone(),
            };
            url.set_query(Some(&query));
        }
        url
    }

    async fn request(
        &self,
        method: reqwest::Method,
        url: Url,
    ) -> StorageResult<reqwest::RequestBuilder> {
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        let mut request = self
            .client
            .request(method, url)
            .header("x-ms-version", API_VERSION)
            .header("x-ms-date", date);
        if let BlobAuth::Bearer(tokens) = &self.auth {
            request = request.header(AUTHORIZATION, tokens.authorization().await?);
        }
        Ok(request)
    }
}

#[async_trait]
impl ArchiveStorage for AzureBlobStorage {
    #[instrument(skip(self), fields(container = %self.container))]
    async fn verify_access(&self) -> StorageResult<()> {
        let response = self
            .request(reqwest::Method::GET, self.container_url())
            .await?
            .send()
            .await
            .map_err(transport_error)?;
        error_for_status(response, &self.container).await?;
        debug!("Azure container is reachable");
        Ok(())
    }

    #[instrument(skip(self, source), fields(container = %self.container, size = source.size_bytes))]
    async fn upload(&self, source: UploadSource<'_>, key: &str) -> StorageResult<RemoteObject> {
        let response = self
            .request(reqwest::Method::PUT, self.blob_url(key))
            .await?
            .header("x-ms-blob-type", "BlockBlob")
            .header(CHECKSUM_HEADER, source.checksum)
            .header(CONTENT_TYPE, "text/csv")
            .header(CONTENT_LENGTH, source.size_bytes)
            .body(file_body(source.path).await?)
            .send()
            .await
            .map_err(transport_error)?;
        error_for_status(response, &self.container).await?;

        let response = self
            .request(reqwest::Method::HEAD, self.blob_url(key))
            .await?
            .send()
            .await
            .map_err(transport_error)?;
        let response = error_for_status(response, &self.container).await?;

        let headers = response.headers();
        let stored_size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let stored_checksum = headers.get(CHECKSUM_HEADER).and_then(|v| v.to_str().ok());

        if stored_size != Some(source.size_bytes) || stored_checksum != Some(source.checksum) {
            return Err(StorageError::Integrity {
                key: key.to_string(),
                detail: format!(
                    "expected {} bytes with sha256 {}, blob has {} bytes with sha256 {}",
                    source.size_bytes,
                    source.checksum,
                    stored_size.map_or_else(|| "?".to_string(), |s| s.to_string()),
                    stored_checksum.unwrap_or("<missing>")
                ),
            });
        }

        info!(key, "Artifact stored in Azure Blob Storage");
        let mut location = self.service_url.clone();
        location.set_query(None);
        if let Ok(mut path) = location.path_segments_mut() {
            path.pop_if_empty()
                .push(&self.container)
                .extend(key.split('/'));
        }
        Ok(RemoteObject {
            location: location.to_string(),
            size_bytes: source.size_bytes,
        })
    }

    fn backend_name(&self) -> &'static str {
        "azure_blob"
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::TempDir;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, header_exists, method, path, query_param},
    };

    use super::*;
    use crate::storage::{StaticToken, file_digest};

    const KEY: &str = "airflow/dag_run/20240601T000000Z.csv";
    const CONTENT: &[u8] = b"id,start_date\n7,2024-01-01 00:00:00\n";

    async fn staged(dir: &TempDir) -> (PathBuf, String, u64) {
        let path = dir.path().join("dag_run.csv");
        tokio::fs::write(&path, CONTENT).await.unwrap();
        let (checksum, size) = file_digest(&path).await.unwrap();
        (path, checksum, size)
    }

    #[test]
    fn test_urls_with_sas() {
        let storage = AzureBlobStorage::with_sas_token(
            "https://acct.blob.core.windows.net/",
            "archive",
            "?sv=1&sig=abc",
        )
        .unwrap();
        assert_eq!(
            storage.blob_url(KEY).as_str(),
            "https://acct.blob.core.windows.net/archive/airflow/dag_run/20240601T000000Z.csv?sv=1&sig=abc"
        );
        assert_eq!(
            storage.container_url().as_str(),
            "https://acct.blob.core.windows.net/archive?restype=container&sv=1&sig=abc"
        );
    }

    #[tokio::test]
    async fn test_upload_with_sas_token() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let (path_buf, checksum, size) = staged(&dir).await;

        Mock::given(method("PUT"))
            .and(path(format!("/archive/{KEY}")))
            .and(query_param("sig", "abc"))
            .and(header("x-ms-blob-type", "BlockBlob"))
            .and(header(CHECKSUM_HEADER, checksum.as_str()))
            .and(header_exists("x-ms-version"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(format!("/archive/{KEY}")))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(CHECKSUM_HEADER, checksum.as_str())
                    .set_body_bytes(CONTENT),
            )
            .expect(1)
            .mount(&server)
            .await;

        let storage =
            AzureBlobStorage::with_sas_token(&server.uri(), "archive", "sv=1&sig=abc").unwrap();
        let remote = storage
            .upload(
                UploadSource {
                    path: &path_buf,
                    checksum: &checksum,
                    size_bytes: size,
                },
                KEY,
            )
            .await
            .unwrap();

        assert_eq!(remote.location, format!("{}/archive/{KEY}", server.uri()));
        assert!(!remote.location.contains("sig="));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_integrity_error() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let (path_buf, checksum, size) = staged(&dir).await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header(CHECKSUM_HEADER, "deadbeef")
                    .set_body_bytes(CONTENT),
            )
            .mount(&server)
            .await;

        let storage = AzureBlobStorage::with_token_source(
            &server.uri(),
            "archive",
            Arc::new(StaticToken("t".into())),
        )
        .unwrap();
        let err = storage
            .upload(
                UploadSource {
                    path: &path_buf,
                    checksum: &checksum,
                    size_bytes: size,
                },
                KEY,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Integrity { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_bearer_token_is_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/archive"))
            .and(query_param("restype", "container"))
            .and(header("authorization", "Bearer t"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let storage = AzureBlobStorage::with_token_source(
            &server.uri(),
            "archive",
            Arc::new(StaticToken("t".into())),
        )
        .unwrap();
        storage.verify_access().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_container() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("ContainerNotFound"))
            .mount(&server)
            .await;

        let storage =
            AzureBlobStorage::with_sas_token(&server.uri(), "archive", "sig=abc").unwrap();
        let err = storage.verify_access().await.unwrap_err();
        assert!(matches!(err, StorageError::BucketNotFound(c) if c == "archive"));
    }

    #[tokio::test]
    async fn test_throttling_is_retryable() {
        let server = MockServer::start().await;
        let dir = TempDir::new().unwrap();
        let (path_buf, checksum, size) = staged(&dir).await;

        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let storage =
            AzureBlobStorage::with_sas_token(&server.uri(), "archive", "sig=abc").unwrap();
        let err = storage
            .upload(
                UploadSource {
                    path: &path_buf,
                    checksum: &checksum,
                    size_bytes: size,
                },
                KEY,
            )
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
