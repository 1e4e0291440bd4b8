//! Shared HTTP plumbing for the provider clients.

use std::time::Duration;

use digitizer_core::{Error, Result};

/// Build a reqwest client with a per-client request timeout.
pub(crate) fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Map a transport error to an external-service failure for `service`.
pub(crate) fn request_error(service: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::external(service, "request timed out")
    } else {
        Error::external(service, format!("request failed: {}", e))
    }
}

/// Turn a non-success response into an external-service failure.
pub(crate) async fn check_status(
    service: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::external(
        service,
        format!("returned {}: {}", status, truncate(&body, 512)),
    ))
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
