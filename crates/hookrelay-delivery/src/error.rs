//! Error types for delivery operations.
//!
//! Classifies every failure a dispatch can hit so the scheduler can decide
//! between retry and terminal failure in one place. Retriable: network
//! errors, timeouts, transformer failures, HTTP 5xx, and 408/425/429 (429
//! honoring Retry-After). Every other 4xx is terminal.

use thiserror::Error;

use hookrelay_core::models::EndpointId;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Error conditions on the dispatch path.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    Network {
        /// Description of the network failure.
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Seconds before the request timed out.
        timeout_seconds: u64,
    },

    /// The endpoint responded with a non-2xx status.
    #[error("endpoint responded with HTTP {status_code}")]
    Endpoint {
        /// HTTP status code.
        status_code: u16,
        /// Truncated response body.
        body: String,
        /// Parsed Retry-After guidance, when the response carried one.
        retry_after_seconds: Option<u64>,
    },

    /// The shared rate limiter denied the attempt.
    ///
    /// Not an attempt: the job re-enqueues with the remaining window and
    /// `num_trials` is untouched.
    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited {
        /// Seconds until the current window ends.
        retry_after_seconds: u64,
    },

    /// The endpoint was disabled mid-flight; the delivery is discarded.
    #[error("endpoint {endpoint_id} is disabled")]
    BreakerOpen {
        /// Endpoint whose breaker tripped.
        endpoint_id: EndpointId,
    },

    /// External transformer invocation failed.
    #[error("transformer failed: {message}")]
    Transform {
        /// Description of the transformer failure.
        message: String,
    },

    /// Storage operation failed during dispatch.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// Invalid endpoint or client configuration.
    #[error("invalid configuration: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// Worker shutdown requested.
    #[error("worker shutdown requested")]
    ShutdownRequested,
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an endpoint response error.
    pub fn endpoint_status(
        status_code: u16,
        body: impl Into<String>,
        retry_after_seconds: Option<u64>,
    ) -> Self {
        Self::Endpoint { status_code, body: body.into(), retry_after_seconds }
    }

    /// Creates a rate limit denial.
    pub fn rate_limited(retry_after_seconds: u64) -> Self {
        Self::RateLimited { retry_after_seconds }
    }

    /// Creates a breaker-open error.
    pub fn breaker_open(endpoint_id: EndpointId) -> Self {
        Self::BreakerOpen { endpoint_id }
    }

    /// Creates a transformer error.
    pub fn transform(message: impl Into<String>) -> Self {
        Self::Transform { message: message.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Whether the scheduler may retry after this failure.
    ///
    /// Network errors, timeouts, transformer failures, HTTP 5xx, and
    /// 408/425/429 are retriable. Other 4xx responses, breaker-open, and
    /// configuration errors are terminal.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::Transform { .. }
            | Self::Storage { .. }
            | Self::RateLimited { .. } => true,

            Self::Endpoint { status_code, .. } => {
                matches!(status_code, 500..=599 | 408 | 425 | 429)
            },

            Self::BreakerOpen { .. } | Self::Configuration { .. } | Self::ShutdownRequested => {
                false
            },
        }
    }

    /// Server-supplied delay before the next attempt, when one exists.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => Some(*retry_after_seconds),
            Self::Endpoint { status_code: 429, retry_after_seconds, .. } => *retry_after_seconds,
            _ => None,
        }
    }
}

impl From<hookrelay_core::CoreError> for DeliveryError {
    fn from(err: hookrelay_core::CoreError) -> Self {
        Self::Storage { message: err.to_string() }
    }
}
