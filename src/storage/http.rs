//! Request plumbing shared by the REST storage backends.

use std::time::Duration;

use super::{StorageError, StorageResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(super) fn build_client() -> StorageResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| StorageError::Config(format!("Failed to build HTTP client: {e}")))
}

/// Stream a staged file as a request body without buffering it.
#[cfg(feature = "azure-storage")]
pub(super) async fn file_body(path: &std::path::Path) -> StorageResult<reqwest::Body> {
    let file = tokio::fs::File::open(path).await?;
    Ok(reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file)))
}

/// Transport failures never reached the service, so they are worth retrying.
pub(super) fn transport_error(err: reqwest::Error) -> StorageError {
    StorageError::Upload(format!("request failed: {err}"))
}

/// Turn a non-success response into a classified error.
pub(super) async fn error_for_status(
    response: reqwest::Response,
    bucket: &str,
) -> StorageResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        truncate(&body, 512)
    };
    Err(StorageError::from_status(status.as_u16(), bucket, message))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
