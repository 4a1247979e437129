//! Error taxonomy and HTTP response conversion.
//!
//! Mirrors the classification in `spec.md` §7: every failure a component can
//! produce is one of [`ErrorKind`], which is both the metrics/log label and
//! the thing HTTP boundaries map to a status code. Large variants are boxed
//! to keep [`Error`] cheap to move.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error as ThisError;

/// Result type alias used throughout `butler-core`.
pub type Result<T> = std::result::Result<T, Error>;

/// The error taxonomy from `spec.md` §7, used in metrics labels, logs, and
/// API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; never counted toward circuit trip.
    ValidationError,
    /// Provider/channel down; counted toward circuit trip when configured.
    TargetUnavailable,
    /// Rate limit hit; recoverable.
    OverloadRejected,
    /// Operation exceeded its budget; counted toward circuit trip when configured.
    Timeout,
    /// Referenced entity missing; terminal for that operation.
    NotFound,
    /// Optimistic-concurrency or uniqueness failure; operation may be retried.
    Conflict,
    /// Unexpected failure; always logged with trace, never silently swallowed.
    InternalError,
}

impl ErrorKind {
    /// Whether a failure of this kind should ever count toward a circuit
    /// breaker's consecutive-failure counter, independent of the per-kind
    /// config flags in [`crate::config::CircuitBreakerConfig`].
    pub fn is_ever_countable(self) -> bool {
        !matches!(self, ErrorKind::ValidationError)
    }

    fn http_status(self) -> StatusCode {
        match self {
            ErrorKind::ValidationError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::OverloadRejected => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::TargetUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::TargetUnavailable => "target_unavailable",
            ErrorKind::OverloadRejected => "overload_rejected",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InternalError => "internal_error",
        };
        write!(f, "{s}")
    }
}

/// The main error type for `butler-core`.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A classified domain failure (the §7 taxonomy), with an optional
    /// advisory retry delay (used for `overload_rejected` / `target_unavailable`).
    #[error("{kind}: {message}")]
    Domain {
        kind: ErrorKind,
        message: String,
        retry_after_seconds: Option<f64>,
    },

    /// Circuit is open; the call was rejected without invoking the callee.
    #[error("circuit open for provider {provider} (opened at {opened_at})")]
    CircuitOpen {
        provider: String,
        opened_at: chrono::DateTime<chrono::Utc>,
        last_error_class: Option<String>,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(Box<figment::Error>),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error not otherwise classified.
    #[error("internal error: {0}")]
    Other(String),
}

impl Error {
    /// Construct a [`Error::Domain`] with no retry hint.
    pub fn domain(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error::Domain {
            kind,
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    /// Construct a [`Error::Domain`] carrying an advisory retry delay.
    pub fn domain_with_retry(
        kind: ErrorKind,
        message: impl Into<String>,
        retry_after_seconds: f64,
    ) -> Self {
        Error::Domain {
            kind,
            message: message.into(),
            retry_after_seconds: Some(retry_after_seconds),
        }
    }

    /// The taxonomy classification, if this error carries one.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Domain { kind, .. } => *kind,
            Error::CircuitOpen { .. } => ErrorKind::TargetUnavailable,
            Error::Config(_) => ErrorKind::InternalError,
            Error::Database(e) => match e {
                sqlx::Error::RowNotFound => ErrorKind::NotFound,
                sqlx::Error::PoolTimedOut => ErrorKind::TargetUnavailable,
                sqlx::Error::Database(db_err)
                    if db_err.is_unique_violation() || db_err.is_foreign_key_violation() =>
                {
                    ErrorKind::Conflict
                }
                _ => ErrorKind::InternalError,
            },
            Error::Io(_) => ErrorKind::InternalError,
            Error::Other(_) => ErrorKind::InternalError,
        }
    }
}

/// Error response body returned at HTTP/MCP boundaries.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<f64>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = kind.http_status();

        if matches!(kind, ErrorKind::InternalError) {
            tracing::error!(error = %self, "internal error");
        } else {
            tracing::warn!(error = %self, %kind, "request failed");
        }

        let retry_after_seconds = match &self {
            Error::Domain {
                retry_after_seconds,
                ..
            } => *retry_after_seconds,
            _ => None,
        };

        let body = ErrorResponse {
            error: self.to_string(),
            error_class: kind.to_string(),
            retry_after_seconds,
        };

        (status, Json(body)).into_response()
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Error::Config(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::domain(ErrorKind::InternalError, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_never_countable() {
        assert!(!ErrorKind::ValidationError.is_ever_countable());
        assert!(ErrorKind::Timeout.is_ever_countable());
        assert!(ErrorKind::TargetUnavailable.is_ever_countable());
    }

    #[test]
    fn http_status_mapping_matches_spec() {
        assert_eq!(ErrorKind::ValidationError.http_status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ErrorKind::NotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::Conflict.http_status(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::OverloadRejected.http_status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(ErrorKind::TargetUnavailable.http_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorKind::Timeout.http_status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ErrorKind::InternalError.http_status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn domain_error_display() {
        let err = Error::domain(ErrorKind::NotFound, "butler not registered");
        assert_eq!(err.to_string(), "not_found: butler not registered");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
