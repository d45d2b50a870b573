//! Error types and result handling for the delivery platform.
//!
//! Defines the error taxonomy shared by repositories, the fan-out planner,
//! and the API surface. Kinds map onto HTTP statuses at the edge: validation
//! and conflict are surfaced synchronously as 4xx, transient failures as 5xx.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for platform operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Bad request: malformed body, unsupported strategy, invalid id.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A subscription filter references an unsupported operator or a
    /// malformed regex. Rejected at write time, never at match time.
    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    /// Entity not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Idempotent duplicate or illegal state transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Queue, cache, or database failure that callers may retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),
}

impl CoreError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates an invalid-filter error.
    pub fn invalid_filter(message: impl Into<String>) -> Self {
        Self::InvalidFilter(message.into())
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    /// Creates a database error.
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }

    /// Whether callers should retry the failed operation.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Database(_))
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::Conflict(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::Conflict(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                Self::Transient(format!("database unavailable: {err}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_identified() {
        assert!(CoreError::transient("queue unavailable").is_transient());
        assert!(CoreError::database("connection lost").is_transient());
        assert!(!CoreError::validation("bad payload").is_transient());
        assert!(!CoreError::conflict("already resent").is_transient());
        assert!(!CoreError::not_found("no such event").is_transient());
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: CoreError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CoreError::NotFound(_)));
    }
}
