//! Credential resolution for remote archive backends.
//!
//! A run names its credentials one of two ways:
//!
//! - `connectionId`: a `[connections.<id>]` entry in the config file
//! - `providerEnvSecretName`: an environment variable holding the credential
//!   material. For `aws` and `azure` that is the connection object as JSON;
//!   for `gcp` it is a service-account key, inline JSON or a path to one.
//!
//! A connection ID wins when both are given.

use std::collections::HashMap;

use tracing::debug;

use super::{StorageError, StorageProvider, StorageResult};
use crate::config::{ConnectionConfig, GcpConnection, GcpCredentials};

/// Resolve the connection for a remote provider.
pub fn resolve_connection(
    provider: StorageProvider,
    connection_id: Option<&str>,
    env_secret_name: Option<&str>,
    connections: &HashMap<String, ConnectionConfig>,
) -> StorageResult<ConnectionConfig> {
    if let Some(id) = connection_id {
        let connection = connections.get(id).ok_or_else(|| {
            StorageError::Credential(format!("connection '{id}' is not configured"))
        })?;
        if connection.provider_name() != provider.as_str() {
            return Err(StorageError::Credential(format!(
                "connection '{id}' is of type '{}' but provider is '{provider}'",
                connection.provider_name()
            )));
        }
        debug!(connection_id = id, %provider, "Resolved credentials from connection");
        return Ok(connection.clone());
    }

    if let Some(var) = env_secret_name {
        let value = std::env::var(var).map_err(|_| {
            StorageError::Credential(format!("environment variable '{var}' is not set"))
        })?;
        if value.trim().is_empty() {
            return Err(StorageError::Credential(format!(
                "environment variable '{var}' is empty"
            )));
        }
        debug!(env = var, %provider, "Resolved credentials from environment");
        return connection_from_secret(provider, var, value);
    }

    Err(StorageError::Credential(format!(
        "provider '{provider}' needs credentials: set connectionId or providerEnvSecretName"
    )))
}

fn connection_from_secret(
    provider: StorageProvider,
    var: &str,
    value: String,
) -> StorageResult<ConnectionConfig> {
    let malformed = |e: serde_json::Error| {
        StorageError::Credential(format!(
            "environment variable '{var}' does not hold a valid {provider} connection: {e}"
        ))
    };

    match provider {
        StorageProvider::Aws => serde_json::from_str(&value)
            .map(ConnectionConfig::Aws)
            .map_err(malformed),
        StorageProvider::Azure => serde_json::from_str(&value)
            .map(ConnectionConfig::Azure)
            .map_err(malformed),
        StorageProvider::Gcp => {
            let credentials = if value.trim_start().starts_with('{') {
                GcpCredentials::ServiceAccountJson { json: value }
            } else {
                GcpCredentials::ServiceAccount {
                    key_path: value.trim().to_string(),
                }
            };
            Ok(ConnectionConfig::Gcp(GcpConnection {
                credentials,
                endpoint: None,
            }))
        }
        StorageProvider::Local => Err(StorageError::Config(
            "local storage does not take credentials".into(),
        )),
    }
}
