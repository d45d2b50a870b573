//! Request handlers.
//!
//! Error mapping is uniform: validation and invalid filters surface as
//! 400, missing entities as 404, conflicts (duplicates, illegal state
//! transitions) as 409, transient backend failures as 503 with nothing
//! persisted.

pub mod event_deliveries;
pub mod events;
pub mod health;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use hookrelay_core::error::CoreError;

pub use event_deliveries::{
    batch_retry_deliveries, count_deliveries, force_resend_deliveries, get_delivery,
    list_deliveries, list_delivery_attempts, resend_delivery,
};
pub use events::{
    batch_replay_events, count_events, create_event, create_fanout_event, get_event, list_events,
    replay_event,
};
pub use health::{health_check, readiness_check};

/// Error payload returned for every failed request.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error kind for client disambiguation.
    pub code: &'static str,
    /// Human-readable description.
    pub message: String,
}

/// Core error wrapper implementing axum's response conversion.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            CoreError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            CoreError::InvalidFilter(_) => (StatusCode::BAD_REQUEST, "invalid_filter"),
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            CoreError::Transient(_) => (StatusCode::SERVICE_UNAVAILABLE, "transient"),
            CoreError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        let body = ErrorResponse {
            error: ErrorDetail { code, message: self.0.to_string() },
        };
        (status, Json(body)).into_response()
    }
}

/// Handler result alias.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
