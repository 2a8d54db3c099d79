use anyhow::{Context, Result, ensure};
use reqwest::Client;
use std::time::Duration;

/// Create an HTTP client whose requests are bounded by `timeout`
///
/// Device traffic and backend traffic both go through clients built here, so
/// a request that neither succeeds nor fails within the timeout is aborted and
/// reported like any other transport error.
///
/// # Examples
/// ```no_run
/// use plant_link::http_client::timeout_client;
/// use std::time::Duration;
///
/// let client = timeout_client(Duration::from_secs(5)).expect("failed to create client");
/// ```
pub fn timeout_client(timeout: Duration) -> Result<Client> {
    ensure!(!timeout.is_zero(), "failed to create HTTP client: zero timeout");

    Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout)
        .build()
        .context("failed to create HTTP client")
}

/// Normalize `path` onto `base` with exactly one separating slash
pub fn build_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let normalized_path = path.trim_start_matches('/');
    format!("{base}/{normalized_path}")
}
