//! HTTP client for webhook delivery.
//!
//! Handles request construction, per-endpoint timeouts, response capture,
//! and error categorization for retry and circuit breaker decisions.

use std::{collections::HashMap, time::Duration};

use bytes::Bytes;
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use hookrelay_core::models::{DeliveryId, EventId};

use crate::error::{DeliveryError, Result};

/// Default per-attempt timeout when the endpoint does not set one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Hard cap on per-attempt timeouts.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Maximum redirect hops followed per attempt.
pub const MAX_REDIRECTS: usize = 3;

/// How much response body is retained on an attempt row.
pub const RESPONSE_DATA_LIMIT: usize = 20 * 1024;

/// Configuration for the delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Fallback timeout for endpoints without an explicit one.
    pub timeout: Duration,
    /// User agent string for outbound requests.
    pub user_agent: String,
    /// Whether to verify TLS certificates.
    pub verify_tls: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            user_agent: "Hookrelay/0.3".to_string(),
            verify_tls: true,
        }
    }
}

/// One outbound delivery request, fully assembled by the dispatcher.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Delivery being attempted.
    pub delivery_id: DeliveryId,
    /// Source event, for tracing.
    pub event_id: EventId,
    /// Destination URL.
    pub url: String,
    /// Headers to send, signature included.
    pub headers: HashMap<String, String>,
    /// JSON body (post-transform when a function is attached).
    pub body: Bytes,
    /// Per-attempt timeout from the endpoint config.
    pub timeout: Duration,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

/// Captured outcome of an HTTP delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated to [`RESPONSE_DATA_LIMIT`].
    pub body: String,
    /// Resolved peer address, when known.
    pub ip_address: String,
    /// Request round-trip time.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

/// HTTP client optimized for webhook delivery.
///
/// Connection pooling across endpoints, bounded redirects, and per-request
/// timeout overrides from endpoint configuration.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a new delivery client.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` when the HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a delivery client with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Executes one delivery attempt.
    ///
    /// Non-2xx responses return `Ok` with `is_success = false`; the caller
    /// classifies them. Only transport-level failures return `Err`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` or `Network` for transport failures.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start = std::time::Instant::now();
        let timeout = clamp_timeout(request.timeout, self.config.timeout);

        let span = info_span!(
            "webhook_delivery",
            delivery_id = %request.delivery_id,
            event_id = %request.event_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            let mut http_request = self
                .client
                .post(&request.url)
                .timeout(timeout)
                .body(request.body.clone())
                .header("content-type", "application/json");

            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key, value);
                }
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!(duration_ms = start.elapsed().as_millis() as u64, error = %e, "request failed");
                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    if e.is_redirect() {
                        return Err(DeliveryError::network(format!(
                            "redirect limit of {MAX_REDIRECTS} exceeded: {e}"
                        )));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let delivery_response = parse_response(response, start.elapsed()).await;
            tracing::debug!(
                status = delivery_response.status_code,
                duration_ms = delivery_response.duration.as_millis() as u64,
                "received response"
            );

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

/// Reads an HTTP response into an attempt-sized capture.
async fn parse_response(response: Response, duration: Duration) -> DeliveryResponse {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();
    let ip_address =
        response.remote_addr().map(|addr| addr.ip().to_string()).unwrap_or_default();
    let headers = extract_headers(response.headers());

    let body = match response.bytes().await {
        Ok(bytes) => truncate_body(&bytes),
        Err(e) => format!("[failed to read response body: {e}]"),
    };

    DeliveryResponse { status_code, headers, body, ip_address, duration, is_success }
}

/// Truncates a response body to [`RESPONSE_DATA_LIMIT`] for storage.
fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() > RESPONSE_DATA_LIMIT {
        let mut end = RESPONSE_DATA_LIMIT;
        while end > 0 && std::str::from_utf8(&bytes[..end]).is_err() {
            end -= 1;
        }
        format!("{}... (truncated)", String::from_utf8_lossy(&bytes[..end]))
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Clamps a per-endpoint timeout into (0, [`MAX_TIMEOUT`]].
fn clamp_timeout(timeout: Duration, fallback: Duration) -> Duration {
    let timeout = if timeout.is_zero() { fallback } else { timeout };
    timeout.min(MAX_TIMEOUT)
}

/// Extracts headers from a reqwest `HeaderMap` into a plain map.
fn extract_headers(header_map: &HeaderMap) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (key, value) in header_map {
        if let Ok(value_str) = value.to_str() {
            headers.insert(key.to_string(), value_str.to_string());
        }
    }
    headers
}

/// Whether a header is managed by the transport and must not be copied
/// from stored event headers.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "content-type"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Parses Retry-After guidance from response headers.
///
/// Accepts both delta-seconds and HTTP-date forms; unparseable values fall
/// back to 60 seconds.
pub fn extract_retry_after_seconds(headers: &HashMap<String, String>) -> Option<u64> {
    const DEFAULT_RETRY_AFTER: u64 = 60;

    let retry_after = headers.get("retry-after").or_else(|| headers.get("Retry-After"))?;

    if let Ok(seconds) = retry_after.parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(date_time) = chrono::DateTime::parse_from_rfc2822(retry_after) {
        let now = chrono::Utc::now();
        let retry_time = date_time.with_timezone(&chrono::Utc);
        if retry_time > now {
            if let Ok(delta) = retry_time.signed_duration_since(now).to_std() {
                return Some(delta.as_secs());
            }
        }
    }

    Some(DEFAULT_RETRY_AFTER)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_request(url: String) -> DeliveryRequest {
        let mut headers = HashMap::new();
        headers.insert("X-Custom-Header".to_string(), "custom-value".to_string());

        DeliveryRequest {
            delivery_id: DeliveryId(Uuid::new_v4()),
            event_id: EventId(Uuid::new_v4()),
            url,
            headers,
            body: Bytes::from(r#"{"id":42}"#),
            timeout: Duration::from_secs(5),
            attempt_number: 1,
        }
    }

    #[tokio::test]
    async fn successful_delivery_captures_response() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(test_request(format!("{}/hook", server.uri()))).await.unwrap();

        assert_eq!(response.status_code, 200);
        assert!(response.is_success);
        assert_eq!(response.body, "OK");
    }

    #[tokio::test]
    async fn non_2xx_is_returned_not_errored() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(test_request(format!("{}/hook", server.uri()))).await.unwrap();

        assert_eq!(response.status_code, 503);
        assert!(!response.is_success);
        assert_eq!(response.body, "unavailable");
    }

    #[tokio::test]
    async fn custom_headers_are_forwarded() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::header("X-Custom-Header", "custom-value"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let result = client.deliver(test_request(format!("{}/hook", server.uri()))).await;
        assert!(result.is_ok());
        server.verify().await;
    }

    #[tokio::test]
    async fn connection_refused_maps_to_network_error() {
        let client = DeliveryClient::with_defaults().unwrap();
        // Reserved port with nothing listening.
        let result = client.deliver(test_request("http://127.0.0.1:9/hook".to_string())).await;
        assert!(matches!(result, Err(DeliveryError::Network { .. })));
    }

    #[tokio::test]
    async fn large_response_bodies_are_truncated() {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64 * 1024)))
            .mount(&server)
            .await;

        let client = DeliveryClient::with_defaults().unwrap();
        let response = client.deliver(test_request(format!("{}/hook", server.uri()))).await.unwrap();

        assert!(response.body.len() <= RESPONSE_DATA_LIMIT + "... (truncated)".len());
        assert!(response.body.ends_with("... (truncated)"));
    }

    #[test]
    fn retry_after_parsing_handles_both_forms() {
        let mut headers = HashMap::new();
        headers.insert("retry-after".to_string(), "120".to_string());
        assert_eq!(extract_retry_after_seconds(&headers), Some(120));

        headers.clear();
        assert_eq!(extract_retry_after_seconds(&headers), None);

        headers.insert("retry-after".to_string(), "not-a-number".to_string());
        assert_eq!(extract_retry_after_seconds(&headers), Some(60));
    }

    #[test]
    fn timeouts_are_clamped_to_the_hard_cap() {
        assert_eq!(
            clamp_timeout(Duration::from_secs(3600), DEFAULT_TIMEOUT),
            MAX_TIMEOUT
        );
        assert_eq!(clamp_timeout(Duration::ZERO, DEFAULT_TIMEOUT), DEFAULT_TIMEOUT);
        assert_eq!(
            clamp_timeout(Duration::from_secs(10), DEFAULT_TIMEOUT),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn managed_headers_are_not_copied() {
        assert!(is_managed_header("Content-Length"));
        assert!(is_managed_header("HOST"));
        assert!(!is_managed_header("X-Hookrelay-Event-Type"));
        assert!(!is_managed_header("Authorization"));
    }
}
