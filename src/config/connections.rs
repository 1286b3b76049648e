//! Named archive storage connections.
//!
//! A run can reference one of these by `connectionId` instead of supplying
//! credential material through the environment.
//!
//! # Example
//!
//! ```toml
//! [connections.archive-s3]
//! type = "aws"
//! access_key_id = "${ARCHIVE_AWS_KEY_ID}"
//! secret_access_key = "${ARCHIVE_AWS_SECRET}"
//! region = "us-east-1"
//!
//! [connections.archive-gcs]
//! type = "gcp"
//! credentials = { type = "service_account", key_path = "/etc/archive/sa.json" }
//!
//! [connections.archive-blob]
//! type = "azure"
//! account_name = "metastorearchive"
//! auth = { type = "sas_token", sas_token = "${ARCHIVE_SAS}" }
//! ```

use serde::{Deserialize, Serialize};

/// A pre-configured credential set for one remote archive provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum ConnectionConfig {
    /// Amazon S3 or an S3-compatible service.
    Aws(AwsConnection),
    /// Google Cloud Storage.
    Gcp(GcpConnection),
    /// Azure Blob Storage.
    Azure(AzureConnection),
}

impl ConnectionConfig {
    /// Provider name as used by the `provider` run option.
    pub fn provider_name(&self) -> &'static str {
        match self {
            ConnectionConfig::Aws(_) => "aws",
            ConnectionConfig::Gcp(_) => "gcp",
            ConnectionConfig::Azure(_) => "azure",
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            ConnectionConfig::Aws(c) => c.validate(),
            ConnectionConfig::Gcp(_) => Ok(()),
            ConnectionConfig::Azure(c) => c.validate(),
        }
    }
}

/// S3 credentials and client settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AwsConnection {
    /// AWS access key ID.
    pub access_key_id: String,

    /// AWS secret access key.
    pub secret_access_key: String,

    /// Session token for temporary credentials.
    #[serde(default)]
    pub session_token: Option<String>,

    /// AWS region (e.g., "us-east-1").
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint URL for S3-compatible services (MinIO, R2, ...).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Use path-style URLs instead of virtual-hosted style.
    #[serde(default)]
    pub force_path_style: bool,
}

impl std::fmt::Debug for AwsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsConnection")
            .field("access_key_id", &"****")
            .field("secret_access_key", &"****")
            .field("session_token", &self.session_token.as_ref().map(|_| "****"))
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .finish()
    }
}

impl AwsConnection {
    pub fn validate(&self) -> Result<(), String> {
        if self.access_key_id.is_empty() || self.secret_access_key.is_empty() {
            return Err("AWS connection requires access_key_id and secret_access_key".into());
        }
        if self.region.is_none() && self.endpoint.is_none() {
            return Err("AWS connection requires either 'region' or 'endpoint'".into());
        }
        Ok(())
    }
}

/// Google Cloud Storage credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcpConnection {
    /// How to obtain an OAuth token.
    #[serde(default)]
    pub credentials: GcpCredentials,

    /// Override for the storage API base URL (emulators).
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// GCP credential configuration.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum GcpCredentials {
    /// Use Application Default Credentials.
    #[default]
    Default,

    /// Use a service account key file.
    ServiceAccount { key_path: String },

    /// Use a service account key from JSON string (useful with env vars).
    ServiceAccountJson { json: String },
}

impl std::fmt::Debug for GcpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcpCredentials::Default => f.write_str("Default"),
            GcpCredentials::ServiceAccount { key_path } => f
                .debug_struct("ServiceAccount")
                .field("key_path", key_path)
                .finish(),
            GcpCredentials::ServiceAccountJson { .. } => f
                .debug_struct("ServiceAccountJson")
                .field("json", &"****")
                .finish(),
        }
    }
}

/// Azure Blob Storage account and authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AzureConnection {
    /// Storage account name.
    pub account_name: String,

    /// Authentication method.
    pub auth: AzureBlobAuth,

    /// Override for the blob service URL (Azurite, sovereign clouds).
    /// Defaults to `https://{account_name}.blob.core.windows.net`.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl AzureConnection {
    pub fn validate(&self) -> Result<(), String> {
        if self.account_name.is_empty() {
            return Err("Azure connection requires account_name".into());
        }
        Ok(())
    }

    /// Blob service base URL without a trailing slash.
    pub fn service_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://{}.blob.core.windows.net", self.account_name),
        }
    }
}

/// Azure Blob authentication configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum AzureBlobAuth {
    /// Shared access signature appended to every request URL.
    SasToken { sas_token: String },

    /// Azure AD / Entra ID service principal.
    ClientSecret {
        tenant_id: String,
        client_id: String,
        client_secret: String,
    },

    /// Managed identity authentication.
    ManagedIdentity {
        /// Client ID of the managed identity (optional for system-assigned).
        #[serde(default)]
        client_id: Option<String>,
    },
}

impl std::fmt::Debug for AzureBlobAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AzureBlobAuth::SasToken { .. } => f
                .debug_struct("SasToken")
                .field("sas_token", &"****")
                .finish(),
            AzureBlobAuth::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"****")
                .finish(),
            AzureBlobAuth::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
        }
    }
}
