use beacon_telemetry::FailureKind;
use serde_json::Value;
use thiserror::Error;

/// API call failures, surfaced to callers unchanged in shape after
/// failed recovery.
#[derive(Error, Debug, Clone)]
pub enum ApiError {
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        body: Value,
    },

    #[error("Request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Cross-origin request blocked: {message}")]
    Cors { message: String },

    #[error("Offline, request queued for replay")]
    Queued { queued_at_ms: i64 },

    #[error("Authentication failed and could not be recovered")]
    AuthFailed,

    #[error("Request could not be dispatched: {message}")]
    Dispatch { message: String },
}

impl ApiError {
    /// The classifier's view of this failure.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            ApiError::Http { status, .. } => FailureKind::Status(*status),
            ApiError::Timeout { .. } => FailureKind::Timeout,
            ApiError::Network { .. } => FailureKind::Connection,
            ApiError::Cors { .. } => FailureKind::CrossOrigin,
            ApiError::Queued { .. } | ApiError::AuthFailed | ApiError::Dispatch { .. } => {
                FailureKind::Other
            }
        }
    }

    /// Short name used in exception records.
    pub fn name(&self) -> &'static str {
        match self {
            ApiError::Http { .. } => "HttpError",
            ApiError::Timeout { .. } => "TimeoutError",
            ApiError::Network { .. } => "NetworkError",
            ApiError::Cors { .. } => "CorsError",
            ApiError::Queued { .. } => "QueuedError",
            ApiError::AuthFailed => "AuthError",
            ApiError::Dispatch { .. } => "DispatchError",
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, ApiError::Queued { .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ApiError::Timeout { timeout_ms: 0 }
        } else if error.is_connect() || error.is_request() {
            ApiError::Network {
                message: error.to_string(),
            }
        } else {
            ApiError::Dispatch {
                message: error.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_telemetry::{classify, ErrorCategory};

    #[test]
    fn errors_feed_the_classifier() {
        let error = ApiError::Http {
            status: 503,
            message: "unavailable".to_string(),
            body: Value::Null,
        };
        assert_eq!(
            classify(&error.failure_kind()).category,
            ErrorCategory::ServerError
        );

        let error = ApiError::Timeout { timeout_ms: 5_000 };
        assert_eq!(
            classify(&error.failure_kind()).category,
            ErrorCategory::TimeoutError
        );

        let error = ApiError::Network {
            message: "refused".to_string(),
        };
        assert_eq!(
            classify(&error.failure_kind()).category,
            ErrorCategory::NetworkError
        );
    }

    #[test]
    fn queued_errors_are_distinguishable() {
        let error = ApiError::Queued { queued_at_ms: 0 };
        assert!(error.is_queued());
        assert!(!ApiError::AuthFailed.is_queued());
    }
}
