//! # Beacon Telemetry
//!
//! Client-resident log pipeline: structured entries are deduplicated,
//! batched, and delivered to an ingestion backend with bounded retry,
//! while a parallel pipeline classifies, filters, and reports
//! exceptions. The whole subsystem is fire-and-forget: nothing in here
//! can crash the host application, and delivery faults never propagate
//! to callers.
//!
//! ## Quick Start
//!
//! ```no_run
//! use beacon_telemetry::{LogLayer, TelemetryConfig, TelemetrySystem};
//!
//! #[tokio::main]
//! async fn main() {
//!     let system = TelemetrySystem::init(TelemetryConfig::default());
//!     system.logger().info(LogLayer::Service, "application started", None);
//!     system.shutdown().await;
//! }
//! ```

pub mod classify;
pub mod config;
pub mod dedup;
pub mod entry;
pub mod exceptions;
pub mod logger;
pub mod system;
pub mod transport;

pub use classify::{classify, Classification, ErrorCategory, FailureKind};
pub use config::TelemetryConfig;
pub use dedup::Deduplicator;
pub use entry::{CallSite, LogEntry, LogLayer, LogLevel};
pub use exceptions::{ExceptionContext, ExceptionRecord, ExceptionReporter};
pub use logger::Logger;
pub use system::TelemetrySystem;
pub use transport::Transport;

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Telemetry-specific errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Ingestion rejected batch: status {status}")]
    Rejected { status: u16 },

    #[error("Send timed out after {timeout_ms}ms")]
    SendTimeout { timeout_ms: u64 },

    #[error(transparent)]
    Core(#[from] beacon_core::CoreError),
}
