//! Bounded retries for archive uploads.

use std::time::Duration;

use tracing::{debug, warn};

use super::{ArchiveStorage, RemoteObject, StorageError, UploadSource};
use crate::config::RetryConfig;

/// Terminal result of an upload, after however many attempts it took.
#[derive(Debug)]
pub struct RetriedUpload {
    pub result: Result<RemoteObject, StorageError>,
    pub attempts: u32,
}

/// Upload with exponential backoff, retrying only transient failures.
///
/// Each attempt runs under `attempt_timeout`; an attempt that overruns is
/// dropped and counts as a retryable [`StorageError::Timeout`]. Keys are
/// deterministic, so a retried upload overwrites rather than duplicates.
pub async fn upload_with_retry(
    storage: &dyn ArchiveStorage,
    source: UploadSource<'_>,
    key: &str,
    config: &RetryConfig,
    attempt_timeout: Duration,
) -> RetriedUpload {
    let max_attempts = config.max_attempts();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(attempt_timeout, storage.upload(source, key)).await
        {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(attempt_timeout)),
        };

        match result {
            Ok(remote) => {
                if attempt > 1 {
                    debug!(
                        backend = storage.backend_name(),
                        key,
                        attempt,
                        "Upload succeeded after retry"
                    );
                }
                return RetriedUpload {
                    result: Ok(remote),
                    attempts: attempt,
                };
            }
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                let delay = config.delay_for_attempt(attempt - 1);
                warn!(
                    backend = storage.backend_name(),
                    key,
                    error = %error,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis(),
                    "Retryable upload error, will retry after delay"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                if attempt > 1 {
                    warn!(
                        backend = storage.backend_name(),
                        key,
                        error = %error,
                        attempts = attempt,
                        "Upload failed after all retry attempts"
                    );
                }
                return RetriedUpload {
                    result: Err(error),
                    attempts: attempt,
                };
            }
        }
    }
}
