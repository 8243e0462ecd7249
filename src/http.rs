use reqwest::{
    Client,
    header::{ACCEPT, HeaderMap, HeaderValue, REFERER},
};
use std::time::Duration;

/// Shared HTTP client for the platform APIs.
///
/// Every request carries the web front-end as `Referer`. Timeouts come from
/// `HTTP_TIMEOUT_SECS` and `HTTP_CONNECT_TIMEOUT_SECS`.
pub fn build_client(referer: &str) -> Client {
    let timeout = env_secs("HTTP_TIMEOUT_SECS", 15);
    let connect = env_secs("HTTP_CONNECT_TIMEOUT_SECS", 5);

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(referer) {
        headers.insert(REFERER, value);
    }

    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .default_headers(headers)
        .build()
        .unwrap_or_else(|_| Client::new())
}

fn env_secs(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}
