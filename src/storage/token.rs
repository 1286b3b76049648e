//! OAuth bearer tokens for the REST storage backends.
//!
//! GCS tokens come from `google-cloud-auth`; Azure Blob tokens from
//! `azure_identity`. Both are cached and refreshed before expiry.

#[cfg(feature = "azure-storage")]
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(feature = "azure-storage")]
use tokio::sync::RwLock;

use super::{StorageError, StorageResult};

/// Source of an `Authorization` header value.
#[async_trait]
pub trait BearerTokenSource: Send + Sync {
    /// Full header value, `Bearer <token>`.
    async fn authorization(&self) -> StorageResult<String>;
}

/// A fixed token, for emulators and tests.
pub struct StaticToken(pub String);

#[async_trait]
impl BearerTokenSource for StaticToken {
    async fn authorization(&self) -> StorageResult<String> {
        Ok(bearer(&self.0))
    }
}

/// Prefix with `Bearer ` unless the value already carries a scheme.
fn bearer(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}

#[cfg(feature = "gcs-storage")]
pub use gcp::GcpTokenSource;

#[cfg(feature = "gcs-storage")]
mod gcp {
    use std::{path::Path, sync::Arc};

    use async_trait::async_trait;
    use google_cloud_token::TokenSourceProvider;

    use super::{BearerTokenSource, bearer};
    use crate::{
        config::GcpCredentials,
        storage::{StorageError, StorageResult},
    };

    /// Read/write scope for Cloud Storage objects and bucket metadata.
    pub const GCS_READ_WRITE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

    /// Token source backed by `google-cloud-auth`, which refreshes internally.
    pub struct GcpTokenSource {
        inner: Arc<dyn google_cloud_token::TokenSource>,
    }

    impl GcpTokenSource {
        pub async fn from_credentials(credentials: &GcpCredentials) -> StorageResult<Self> {
            let config =
                google_cloud_auth::project::Config::default().with_scopes(&[GCS_READ_WRITE_SCOPE]);

            let provider = match credentials {
                GcpCredentials::Default => {
                    google_cloud_auth::token::DefaultTokenSourceProvider::new(config)
                        .await
                        .map_err(|e| {
                            StorageError::Credential(format!(
                                "Failed to load application default credentials: {e}"
                            ))
                        })?
                }
                GcpCredentials::ServiceAccount { key_path } => {
                    let json = tokio::fs::read_to_string(Path::new(key_path))
                        .await
                        .map_err(|e| {
                            StorageError::Credential(format!(
                                "Failed to read service account key file '{key_path}': {e}"
                            ))
                        })?;
                    Self::provider_from_json(config, &json).await?
                }
                GcpCredentials::ServiceAccountJson { json } => {
                    Self::provider_from_json(config, json).await?
                }
            };

            Ok(Self {
                inner: provider.token_source(),
            })
        }

        async fn provider_from_json(
            config: google_cloud_auth::project::Config<'_>,
            json: &str,
        ) -> StorageResult<google_cloud_auth::token::DefaultTokenSourceProvider> {
            use google_cloud_auth::credentials::CredentialsFile;

            let creds: CredentialsFile = serde_json::from_str(json).map_err(|e| {
                StorageError::Credential(format!("Failed to parse service account JSON: {e}"))
            })?;

            google_cloud_auth::token::DefaultTokenSourceProvider::new_with_credentials(
                config,
                Box::new(creds),
            )
            .await
            .map_err(|e| {
                StorageError::Credential(format!(
                    "Failed to create token source from service account: {e}"
                ))
            })
        }
    }

    #[async_trait]
    impl BearerTokenSource for GcpTokenSource {
        async fn authorization(&self) -> StorageResult<String> {
            let token = self
                .inner
                .token()
                .await
                .map_err(|e| StorageError::Credential(format!("Failed to get GCP token: {e}")))?;
            Ok(bearer(&token))
        }
    }
}

#[cfg(feature = "azure-storage")]
pub use azure::AzureTokenSource;

#[cfg(feature = "azure-storage")]
mod azure {
    use super::*;
    use azure_core::credentials::{AccessToken, Secret, TokenCredential};
    use azure_identity::{
        ClientSecretCredential, ManagedIdentityCredential, ManagedIdentityCredentialOptions,
        UserAssignedId,
    };

    /// Scope for Azure Storage data-plane access.
    pub const AZURE_STORAGE_SCOPE: &str = "https://storage.azure.com/.default";

    /// Refresh this long before the token actually expires.
    const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

    #[derive(Debug, Clone)]
    struct CachedToken {
        bearer_header: Arc<str>,
        expires_at: std::time::Instant,
    }

    impl CachedToken {
        fn is_expired(&self) -> bool {
            std::time::Instant::now() >= self.expires_at
        }
    }

    /// Token source for Entra ID service principals and managed identities.
    pub struct AzureTokenSource {
        credential: Arc<dyn TokenCredential>,
        auth_type: &'static str,
        cached_token: RwLock<Option<CachedToken>>,
    }

    impl std::fmt::Debug for AzureTokenSource {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("AzureTokenSource")
                .field("type", &self.auth_type)
                .finish()
        }
    }

    impl AzureTokenSource {
        pub fn from_client_secret(
            tenant_id: &str,
            client_id: &str,
            client_secret: &str,
        ) -> StorageResult<Self> {
            let credential = ClientSecretCredential::new(
                tenant_id,
                client_id.to_string(),
                Secret::new(client_secret.to_string()),
                None,
            )
            .map_err(|e| {
                StorageError::Credential(format!("Failed to create client secret credential: {e}"))
            })?;

            Ok(Self {
                credential,
                auth_type: "ClientSecret",
                cached_token: RwLock::new(None),
            })
        }

        /// For a user-assigned identity pass its client ID; `None` selects
        /// the system-assigned identity.
        pub fn from_managed_identity(client_id: Option<&str>) -> StorageResult<Self> {
            let options = client_id.map(|id| ManagedIdentityCredentialOptions {
                user_assigned_id: Some(UserAssignedId::ClientId(id.to_string())),
                ..Default::default()
            });

            let credential = ManagedIdentityCredential::new(options).map_err(|e| {
                StorageError::Credential(format!(
                    "Failed to create managed identity credential: {e}"
                ))
            })?;

            Ok(Self {
                credential,
                auth_type: "ManagedIdentity",
                cached_token: RwLock::new(None),
            })
        }
    }

    #[async_trait]
    impl BearerTokenSource for AzureTokenSource {
        async fn authorization(&self) -> StorageResult<String> {
            {
                let cache = self.cached_token.read().await;
                if let Some(ref cached) = *cache
                    && !cached.is_expired()
                {
                    return Ok(cached.bearer_header.to_string());
                }
            }

            let mut cache = self.cached_token.write().await;
            if let Some(ref cached) = *cache
                && !cached.is_expired()
            {
                return Ok(cached.bearer_header.to_string());
            }

            let access_token: AccessToken = self
                .credential
                .get_token(&[AZURE_STORAGE_SCOPE], None)
                .await
                .map_err(|e| StorageError::Credential(format!("Failed to get Azure token: {e}")))?;

            let now = time::OffsetDateTime::now_utc();
            let expires_in_secs = (access_token.expires_on - now).whole_seconds().max(0) as u64;
            let expires_at = std::time::Instant::now()
                + std::time::Duration::from_secs(expires_in_secs)
                    .saturating_sub(std::time::Duration::from_secs(TOKEN_REFRESH_BUFFER_SECS));

            let bearer_header: Arc<str> =
                format!("Bearer {}", access_token.token.secret()).into();
            *cache = Some(CachedToken {
                bearer_header: bearer_header.clone(),
                expires_at,
            });

            tracing::debug!(
                auth_type = self.auth_type,
                expires_in_secs,
                "Acquired new Azure storage token"
            );

            Ok(bearer_header.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_adds_scheme() {
        let token = StaticToken("abc".into());
        assert_eq!(token.authorization().await.unwrap(), "Bearer abc");
    }

    #[tokio::test]
    async fn test_static_token_keeps_existing_scheme() {
        let token = StaticToken("Bearer abc".into());
        assert_eq!(token.authorization().await.unwrap(), "Bearer abc");
    }
}
