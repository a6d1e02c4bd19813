//! HTTP client for the central backend.
//!
//! Implements [`RemoteBackend`] over the backend's REST API. Every failure is
//! classified into [`RemoteError`] so the sync coordinator can tell a missing
//! network from a rejected request.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PosError, PosResult, RemoteError};
use crate::models::{CreateSaleRequest, StockAdjustmentRequest};
use crate::sync::RemoteBackend;

const HEALTH_PATH: &str = "/api/health";
const SALES_PATH: &str = "/api/sales";
const ADJUST_STOCK_PATH: &str = "/api/inventory/adjust-stock";

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Host part of `host[:port][/path]`, without brackets for IPv6 literals.
fn host_name(authority: &str) -> &str {
    let end = authority
        .find(|c| matches!(c, '/' | '?' | '#'))
        .unwrap_or(authority.len());
    let authority = &authority[..end];
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    authority.rsplit_once(':').map_or(authority, |(host, _)| host)
}

/// Loopback, RFC 1918 private ranges and the Android emulator host alias.
fn is_local_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_private(),
        Ok(IpAddr::V6(ip)) => ip.is_loopback(),
        Err(_) => false,
    }
}

/// Normalise the backend base URL:
/// - add a scheme when none is given (http for local hosts, https otherwise)
/// - keep an explicit scheme as written
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_backend_url(url: &str) -> String {
    let trimmed = url.trim();
    let (scheme, host) = if let Some(rest) = trimmed.strip_prefix("https://") {
        ("https", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        ("http", rest)
    } else if is_local_host(host_name(trimmed)) {
        ("http", trimmed)
    } else {
        ("https", trimmed)
    };

    let mut url = format!("{scheme}://{host}");

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }
    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Transport failures: anything that never produced an HTTP status is a
/// network problem, except a request we could not even build.
fn classify_transport(base: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_builder() {
        return RemoteError::InvalidPayload(format!("Invalid backend URL: {base}"));
    }
    if err.is_connect() {
        return RemoteError::Network(format!("Cannot reach backend at {base}"));
    }
    if err.is_timeout() {
        return RemoteError::Network(format!("Connection to {base} timed out"));
    }
    RemoteError::Network(format!("Network error communicating with {base}: {err}"))
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Backend endpoint not found".to_string(),
        s if s >= 500 => format!("Backend server error (HTTP {s})"),
        s => format!("Unexpected response from backend (HTTP {s})"),
    }
}

/// Non-success response into a rejection, keeping the backend's own message
/// when the body carries one.
fn rejection(status: StatusCode, body: &str) -> RemoteError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("error")
                .or_else(|| json.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| status_message(status));
    RemoteError::Rejected {
        status: status.as_u16(),
        message,
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> PosResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PosError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_backend_url(base_url),
            api_key: api_key.trim().to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Per-request timeout the client was built with.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn post_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), RemoteError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_transport(&self.base_url, &e))?;

        let status = resp.status();
        if status.is_success() {
            debug!(path, status = status.as_u16(), "Backend accepted request");
            return Ok(());
        }

        let body_text = resp.text().await.unwrap_or_default();
        let err = rejection(status, &body_text);
        warn!(path, status = status.as_u16(), "Backend rejected request: {err}");
        Err(err)
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn is_reachable(&self) -> bool {
        let url = format!("{}{HEALTH_PATH}", self.base_url);
        match self.client.get(&url).bearer_auth(&self.api_key).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Health probe failed: {}", classify_transport(&self.base_url, &e));
                false
            }
        }
    }

    async fn create_sale(&self, sale: &CreateSaleRequest) -> Result<(), RemoteError> {
        self.post_json(SALES_PATH, sale).await
    }

    async fn adjust_stock(&self, adjustment: &StockAdjustmentRequest) -> Result<(), RemoteError> {
        self.post_json(ADJUST_STOCK_PATH, adjustment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_backend_url() {
        assert_eq!(
            normalize_backend_url("pos.example.com/api/"),
            "https://pos.example.com"
        );
        assert_eq!(
            normalize_backend_url("  https://pos.example.com// "),
            "https://pos.example.com"
        );
        assert_eq!(normalize_backend_url("localhost:8000"), "http://localhost:8000");
        assert_eq!(normalize_backend_url("192.168.1.20:8000/api"), "http://192.168.1.20:8000");
        assert_eq!(normalize_backend_url("http://10.0.2.2:8000"), "http://10.0.2.2:8000");
    }

    #[test]
    fn test_explicit_scheme_and_public_hosts_keep_tls() {
        // An explicit https is never downgraded, even for a LAN address.
        assert_eq!(
            normalize_backend_url("https://192.168.1.20:8000/api"),
            "https://192.168.1.20:8000"
        );
        // Only 172.16.0.0/12 is private.
        assert_eq!(normalize_backend_url("172.217.3.4/api"), "https://172.217.3.4");
        assert_eq!(normalize_backend_url("172.20.0.5:8000"), "http://172.20.0.5:8000");
        assert_eq!(normalize_backend_url("172.32.0.1"), "https://172.32.0.1");
        assert_eq!(normalize_backend_url("[::1]:8000"), "http://[::1]:8000");
        assert_eq!(normalize_backend_url("localhost.example.com"), "https://localhost.example.com");
    }

    #[test]
    fn test_rejection_prefers_backend_message() {
        let err = rejection(
            StatusCode::UNPROCESSABLE_ENTITY,
            r#"{"error":"Product 10001 not found"}"#,
        );
        assert_eq!(
            err,
            RemoteError::Rejected {
                status: 422,
                message: "Product 10001 not found".into()
            }
        );
        assert!(!err.is_network());
    }

    #[test]
    fn test_rejection_falls_back_to_status_text() {
        match rejection(StatusCode::UNAUTHORIZED, "<html>nope</html>") {
            RemoteError::Rejected { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "API key is invalid or expired");
            }
            other => panic!("unexpected {other:?}"),
        }
        match rejection(StatusCode::BAD_GATEWAY, "") {
            RemoteError::Rejected { message, .. } => {
                assert_eq!(message, "Backend server error (HTTP 502)")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_network_class() {
        // Nothing listens on port 9 of the loopback interface.
        let backend = HttpBackend::new("http://127.0.0.1:9", "key", Duration::from_secs(2)).unwrap();
        assert!(!backend.is_reachable().await);

        let err = backend
            .adjust_stock(&StockAdjustmentRequest {
                product_id: 10001,
                quantity_change: 5.0,
            })
            .await
            .unwrap_err();
        assert!(err.is_network(), "{err:?}");
    }
}
