//! # Beacon Client
//!
//! Resilience layer for outbound API calls. Every request runs through
//! three explicit interceptor stages on an [`ApiClient`] instance:
//! request (correlation headers), response (caching, slow-call
//! flagging), and error (classification, exception reporting,
//! recovery). Recovery covers bounded retry with backoff, cache
//! fallback for GETs, offline queueing for writes, and a pluggable
//! auth-recovery hook for 401s. Errors that cannot be recovered reach
//! the caller unchanged in shape.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod mock;
pub mod offline;
pub mod recovery;

pub use cache::ResponseCache;
pub use client::{ApiClient, ApiRequest, ApiResponse, DispatchedResponse, Dispatcher};
pub use config::ClientConfig;
pub use error::ApiError;
pub use mock::MockDispatcher;
pub use offline::OfflineQueue;
pub use recovery::{AuthOutcome, AuthRecovery, RetryLedger};

pub type Result<T> = std::result::Result<T, ApiError>;
