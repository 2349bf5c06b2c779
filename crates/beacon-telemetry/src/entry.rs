//! Structured log entry model
//!
//! Every event that travels through the pipeline is a [`LogEntry`].
//! Construction is the fail-fast boundary: an entry missing a required
//! field is a programming defect in the producer and is rejected
//! synchronously, before it can reach the deduplicator or transport.

use beacon_core::CoreError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire value for the `source` field; the backend routes on it.
pub const SOURCE: &str = "frontend";

/// Timestamp format with millisecond precision.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Serialized `extra_data` larger than this is replaced by a marker.
pub const MAX_EXTRA_BYTES: usize = 8 * 1024;

/// Severity levels with ordinal values used for threshold filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// Ordinal used for threshold comparison.
    pub fn value(&self) -> u8 {
        match self {
            LogLevel::Debug => 10,
            LogLevel::Info => 20,
            LogLevel::Warning => 30,
            LogLevel::Error => 40,
            LogLevel::Critical => 50,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARNING" | "WARN" => Some(LogLevel::Warning),
            "ERROR" => Some(LogLevel::Error),
            "CRITICAL" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The producing subsystem of an entry. Closed set; backend dashboards
/// group on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogLayer {
    Service,
    Router,
    Auth,
    Store,
    Component,
    Hook,
    Performance,
}

impl LogLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLayer::Service => "Service",
            LogLayer::Router => "Router",
            LogLayer::Auth => "Auth",
            LogLayer::Store => "Store",
            LogLayer::Component => "Component",
            LogLayer::Hook => "Hook",
            LogLayer::Performance => "Performance",
        }
    }
}

impl std::fmt::Display for LogLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Best-effort producing call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSite {
    pub file: String,
    pub line: u32,
    pub function: String,
}

impl CallSite {
    /// Capture the caller's location. `function` comes from the logging
    /// macros; plain method calls pass "unknown".
    #[track_caller]
    pub fn capture(function: &str) -> Self {
        let location = std::panic::Location::caller();
        Self {
            file: location.file().to_string(),
            line: location.line(),
            function: if function.is_empty() {
                "unknown".to_string()
            } else {
                function.to_string()
            },
        }
    }

    pub fn unknown() -> Self {
        Self {
            file: "unknown".to_string(),
            line: 0,
            function: "unknown".to_string(),
        }
    }
}

/// One observed event, fully formed and validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub source: String,
    pub level: LogLevel,
    pub layer: LogLayer,
    pub message: String,
    pub file: String,
    pub line: u32,
    pub function: String,
    pub trace_id: String,
    pub request_id: Option<String>,
    pub user_id: Option<String>,
    pub extra_data: Option<Value>,
    pub created_at: String,
}

impl LogEntry {
    /// Build and validate an entry. Returns a construction defect error
    /// when any required field is missing or empty.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        level: LogLevel,
        layer: LogLayer,
        message: &str,
        site: CallSite,
        trace_id: &str,
        request_id: Option<String>,
        user_id: Option<String>,
        extra_data: Option<Value>,
    ) -> Result<Self, CoreError> {
        let entry = Self {
            source: SOURCE.to_string(),
            level,
            layer,
            message: message.to_string(),
            file: site.file,
            line: site.line,
            function: site.function,
            trace_id: trace_id.to_string(),
            request_id,
            user_id,
            extra_data: extra_data.map(bound_extra_data),
            created_at: Utc::now().format(TIMESTAMP_FORMAT).to_string(),
        };
        entry.validate()?;
        Ok(entry)
    }

    /// Check the required-field invariant. A failure here is a defect
    /// in the producing code, not a runtime condition.
    pub fn validate(&self) -> Result<(), CoreError> {
        for (field, value) in [
            ("source", self.source.as_str()),
            ("message", self.message.as_str()),
            ("file", self.file.as_str()),
            ("function", self.function.as_str()),
            ("trace_id", self.trace_id.as_str()),
            ("created_at", self.created_at.as_str()),
        ] {
            if value.is_empty() {
                return Err(CoreError::InvalidEntry {
                    message: format!("required field '{field}' is empty"),
                });
            }
        }
        Ok(())
    }
}

/// Replace oversize payloads with a marker instead of dropping the
/// entry; the entry itself stays deliverable.
fn bound_extra_data(extra: Value) -> Value {
    let serialized = extra.to_string();
    if serialized.len() <= MAX_EXTRA_BYTES {
        extra
    } else {
        serde_json::json!({
            "truncated": true,
            "original_bytes": serialized.len(),
        })
    }
}

/// Wire shape for the ingestion endpoint; internal names are mapped to
/// the backend's field names.
#[derive(Debug, Serialize)]
pub struct WireLogEntry<'a> {
    pub source: &'a str,
    pub level: LogLevel,
    pub layer: LogLayer,
    pub message: &'a str,
    #[serde(rename = "module")]
    pub file: &'a str,
    #[serde(rename = "line_number")]
    pub line: u32,
    pub function: &'a str,
    pub trace_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_data: Option<&'a Value>,
    pub created_at: &'a str,
}

impl<'a> From<&'a LogEntry> for WireLogEntry<'a> {
    fn from(entry: &'a LogEntry) -> Self {
        Self {
            source: &entry.source,
            level: entry.level,
            layer: entry.layer,
            message: &entry.message,
            file: &entry.file,
            line: entry.line,
            function: &entry.function,
            trace_id: &entry.trace_id,
            request_id: entry.request_id.as_deref(),
            user_id: entry.user_id.as_deref(),
            extra_data: entry.extra_data.as_ref(),
            created_at: &entry.created_at,
        }
    }
}

/// Resolve the enclosing function path, e.g. `my_app::checkout::submit`.
#[macro_export]
macro_rules! caller_function {
    () => {{
        fn __here() {}
        fn __name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = __name_of(__here);
        name.trim_end_matches("::__here")
    }};
}
