//! Failure classification
//!
//! Maps an observed failure onto a closed taxonomy. First match wins;
//! the resulting [`Classification`] drives recovery decisions in the
//! API client and severity in the exception pipeline. Business
//! sub-codes bucket HTTP failures for analytics and never influence
//! control flow.

use crate::entry::LogLevel;
use serde::{Deserialize, Serialize};

/// Closed failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    NetworkError,
    TimeoutError,
    ServerError,
    RateLimitError,
    AuthenticationError,
    AuthorizationError,
    ClientError,
    CorsError,
    UnknownError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NetworkError => "NETWORK_ERROR",
            ErrorCategory::TimeoutError => "TIMEOUT_ERROR",
            ErrorCategory::ServerError => "SERVER_ERROR",
            ErrorCategory::RateLimitError => "RATE_LIMIT_ERROR",
            ErrorCategory::AuthenticationError => "AUTHENTICATION_ERROR",
            ErrorCategory::AuthorizationError => "AUTHORIZATION_ERROR",
            ErrorCategory::ClientError => "CLIENT_ERROR",
            ErrorCategory::CorsError => "CORS_ERROR",
            ErrorCategory::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What actually went wrong, stripped to the facts classification
/// needs. Producers (the API client, the panic hook) convert their own
/// error types into this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Request never completed: connection refused, DNS, reset.
    Connection,
    /// Request exceeded its deadline.
    Timeout,
    /// Blocked by a cross-origin policy before reaching the server.
    CrossOrigin,
    /// Completed with a non-success status.
    Status(u16),
    /// Anything else.
    Other,
}

/// Classification result attached to exception records and consulted
/// by recovery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub recoverable: bool,
    pub retryable: bool,
    pub severity: LogLevel,
    /// Bucketed analytics sub-code for HTTP failures; see [`business_bucket`].
    pub business_code: Option<u32>,
}

/// First-match-wins classification.
pub fn classify(kind: &FailureKind) -> Classification {
    match kind {
        FailureKind::Timeout => Classification {
            category: ErrorCategory::TimeoutError,
            recoverable: true,
            retryable: true,
            severity: LogLevel::Warning,
            business_code: None,
        },
        FailureKind::Connection => Classification {
            category: ErrorCategory::NetworkError,
            recoverable: true,
            retryable: true,
            severity: LogLevel::Error,
            business_code: None,
        },
        FailureKind::CrossOrigin => Classification {
            category: ErrorCategory::CorsError,
            recoverable: false,
            retryable: false,
            severity: LogLevel::Error,
            business_code: None,
        },
        FailureKind::Status(status) => classify_status(*status),
        FailureKind::Other => Classification {
            category: ErrorCategory::UnknownError,
            recoverable: false,
            retryable: false,
            severity: LogLevel::Error,
            business_code: None,
        },
    }
}

fn classify_status(status: u16) -> Classification {
    match status {
        401 => Classification {
            category: ErrorCategory::AuthenticationError,
            recoverable: true,
            retryable: false,
            severity: LogLevel::Error,
            business_code: Some(business_code(status)),
        },
        403 => Classification {
            category: ErrorCategory::AuthorizationError,
            recoverable: false,
            retryable: false,
            severity: LogLevel::Error,
            business_code: Some(business_code(status)),
        },
        429 => Classification {
            category: ErrorCategory::RateLimitError,
            recoverable: true,
            retryable: true,
            severity: LogLevel::Warning,
            business_code: Some(business_code(status)),
        },
        500..=599 => Classification {
            category: ErrorCategory::ServerError,
            recoverable: true,
            retryable: true,
            severity: LogLevel::Error,
            business_code: Some(business_code(status)),
        },
        400..=499 => Classification {
            category: ErrorCategory::ClientError,
            recoverable: false,
            retryable: false,
            severity: LogLevel::Warning,
            business_code: Some(business_code(status)),
        },
        _ => Classification {
            category: ErrorCategory::UnknownError,
            recoverable: false,
            retryable: false,
            severity: LogLevel::Error,
            business_code: None,
        },
    }
}

/// Bucketed analytics sub-code for an HTTP status.
fn business_code(status: u16) -> u32 {
    match status {
        401 => 1000,
        410 | 423 => 2000,
        403 => 3000,
        400 | 404 | 409 | 422 => 4000,
        429 => 5100,
        500..=599 => 5000,
        _ => 4900,
    }
}

/// Human-readable bucket name for a business sub-code.
pub fn business_bucket(code: u32) -> &'static str {
    match code {
        1000..=1999 => "credentials",
        2000..=2999 => "account",
        3000..=3999 => "permission",
        4000..=4999 => "validation",
        _ => "system",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_onto_the_taxonomy() {
        assert_eq!(
            classify(&FailureKind::Status(401)).category,
            ErrorCategory::AuthenticationError
        );
        assert_eq!(
            classify(&FailureKind::Status(403)).category,
            ErrorCategory::AuthorizationError
        );
        assert_eq!(
            classify(&FailureKind::Status(429)).category,
            ErrorCategory::RateLimitError
        );
        assert_eq!(
            classify(&FailureKind::Status(503)).category,
            ErrorCategory::ServerError
        );
        assert_eq!(
            classify(&FailureKind::Status(422)).category,
            ErrorCategory::ClientError
        );
    }

    #[test]
    fn transport_failures_map_onto_the_taxonomy() {
        assert_eq!(
            classify(&FailureKind::Connection).category,
            ErrorCategory::NetworkError
        );
        assert_eq!(
            classify(&FailureKind::Timeout).category,
            ErrorCategory::TimeoutError
        );
        assert_eq!(
            classify(&FailureKind::CrossOrigin).category,
            ErrorCategory::CorsError
        );
        assert_eq!(
            classify(&FailureKind::Other).category,
            ErrorCategory::UnknownError
        );
    }

    #[test]
    fn retryability_follows_the_category() {
        assert!(classify(&FailureKind::Status(503)).retryable);
        assert!(classify(&FailureKind::Status(429)).retryable);
        assert!(classify(&FailureKind::Connection).retryable);
        assert!(!classify(&FailureKind::Status(401)).retryable);
        assert!(!classify(&FailureKind::Status(404)).retryable);
        assert!(!classify(&FailureKind::CrossOrigin).retryable);
    }

    #[test]
    fn auth_failures_are_recoverable_but_not_retryable() {
        let classification = classify(&FailureKind::Status(401));
        assert!(classification.recoverable);
        assert!(!classification.retryable);
    }

    #[test]
    fn business_codes_bucket_for_analytics_only() {
        assert_eq!(business_bucket(1000), "credentials");
        assert_eq!(business_bucket(2000), "account");
        assert_eq!(business_bucket(3000), "permission");
        assert_eq!(business_bucket(4000), "validation");
        assert_eq!(business_bucket(5000), "system");

        assert_eq!(
            classify(&FailureKind::Status(422)).business_code,
            Some(4000)
        );
        assert_eq!(classify(&FailureKind::Connection).business_code, None);
    }

    #[test]
    fn wire_category_names_are_screaming_snake() {
        let json = serde_json::to_string(&ErrorCategory::NetworkError).unwrap();
        assert_eq!(json, "\"NETWORK_ERROR\"");
    }
}
