//! Logger facade
//!
//! The single producer-facing surface of the log pipeline. Builds a
//! validated entry from the correlation context and the call site, asks
//! the deduplicator whether to proceed, then fans out to the transport
//! and the local tracing mirror according to the configured thresholds.
//! Every internal failure is caught here: logging can never crash the
//! host application.

use crate::config::LoggingConfig;
use crate::dedup::Deduplicator;
use crate::entry::{CallSite, LogEntry, LogLayer, LogLevel};
use crate::transport::Transport;
use beacon_core::ContextManager;
use serde_json::Value;
use std::sync::Arc;

pub struct Logger {
    enabled: bool,
    config: LoggingConfig,
    context: Arc<ContextManager>,
    dedup: Arc<Deduplicator>,
    transport: Arc<Transport>,
}

impl Logger {
    pub fn new(
        enabled: bool,
        config: LoggingConfig,
        context: Arc<ContextManager>,
        dedup: Arc<Deduplicator>,
        transport: Arc<Transport>,
    ) -> Self {
        Self {
            enabled,
            config,
            context,
            dedup,
            transport,
        }
    }

    #[track_caller]
    pub fn debug(&self, layer: LogLayer, message: &str, extra: Option<Value>) {
        self.log(LogLevel::Debug, layer, message, extra);
    }

    #[track_caller]
    pub fn info(&self, layer: LogLayer, message: &str, extra: Option<Value>) {
        self.log(LogLevel::Info, layer, message, extra);
    }

    #[track_caller]
    pub fn warn(&self, layer: LogLayer, message: &str, extra: Option<Value>) {
        self.log(LogLevel::Warning, layer, message, extra);
    }

    #[track_caller]
    pub fn error(&self, layer: LogLayer, message: &str, extra: Option<Value>) {
        self.log(LogLevel::Error, layer, message, extra);
    }

    #[track_caller]
    pub fn critical(&self, layer: LogLayer, message: &str, extra: Option<Value>) {
        self.log(LogLevel::Critical, layer, message, extra);
    }

    #[track_caller]
    pub fn log(&self, level: LogLevel, layer: LogLayer, message: &str, extra: Option<Value>) {
        self.log_from(level, layer, message, extra, "unknown");
    }

    /// Entry point used by the `log_*!` macros, which resolve the
    /// enclosing function name at the call site.
    #[track_caller]
    pub fn log_from(
        &self,
        level: LogLevel,
        layer: LogLayer,
        message: &str,
        extra: Option<Value>,
        function: &str,
    ) {
        if !self.enabled {
            return;
        }

        let site = CallSite::capture(function);
        if let Err(error) = self.try_log(level, layer, message, extra, site) {
            // Degrade to a local diagnostic; see module docs.
            tracing::warn!(%error, message, "log entry could not be produced");
        }
    }

    fn try_log(
        &self,
        level: LogLevel,
        layer: LogLayer,
        message: &str,
        extra: Option<Value>,
        site: CallSite,
    ) -> Result<(), beacon_core::CoreError> {
        let entry = LogEntry::new(
            level,
            layer,
            message,
            site,
            &self.context.trace_id(),
            self.context.current_request_id(),
            self.context.user_id(),
            extra,
        )?;

        if !self.dedup.should_log(&entry) {
            tracing::trace!(message = %entry.message, "suppressed duplicate log entry");
            return Ok(());
        }

        if entry.level.value() >= self.config.transport_level.value() {
            self.transport.enqueue(entry.clone());
        }

        if entry.level.value() >= self.config.console_level.value() {
            mirror_to_tracing(&entry);
        }

        Ok(())
    }
}

/// One consistent local format: `[LEVEL] [Layer] message`.
fn mirror_to_tracing(entry: &LogEntry) {
    let line = format!("[{}] [{}] {}", entry.level, entry.layer, entry.message);
    match entry.level {
        LogLevel::Debug => tracing::debug!("{line}"),
        LogLevel::Info => tracing::info!("{line}"),
        LogLevel::Warning => tracing::warn!("{line}"),
        LogLevel::Error | LogLevel::Critical => tracing::error!("{line}"),
    }
}

/// Log at DEBUG with the enclosing function captured as the call site.
#[macro_export]
macro_rules! log_debug {
    ($logger:expr, $layer:expr, $msg:expr) => {
        $logger.log_from($crate::LogLevel::Debug, $layer, $msg, None, $crate::caller_function!())
    };
    ($logger:expr, $layer:expr, $msg:expr, $extra:expr) => {
        $logger.log_from($crate::LogLevel::Debug, $layer, $msg, Some($extra), $crate::caller_function!())
    };
}

/// Log at INFO with the enclosing function captured as the call site.
#[macro_export]
macro_rules! log_info {
    ($logger:expr, $layer:expr, $msg:expr) => {
        $logger.log_from($crate::LogLevel::Info, $layer, $msg, None, $crate::caller_function!())
    };
    ($logger:expr, $layer:expr, $msg:expr, $extra:expr) => {
        $logger.log_from($crate::LogLevel::Info, $layer, $msg, Some($extra), $crate::caller_function!())
    };
}

/// Log at WARNING with the enclosing function captured as the call site.
#[macro_export]
macro_rules! log_warn {
    ($logger:expr, $layer:expr, $msg:expr) => {
        $logger.log_from($crate::LogLevel::Warning, $layer, $msg, None, $crate::caller_function!())
    };
    ($logger:expr, $layer:expr, $msg:expr, $extra:expr) => {
        $logger.log_from($crate::LogLevel::Warning, $layer, $msg, Some($extra), $crate::caller_function!())
    };
}

/// Log at ERROR with the enclosing function captured as the call site.
#[macro_export]
macro_rules! log_error {
    ($logger:expr, $layer:expr, $msg:expr) => {
        $logger.log_from($crate::LogLevel::Error, $layer, $msg, None, $crate::caller_function!())
    };
    ($logger:expr, $layer:expr, $msg:expr, $extra:expr) => {
        $logger.log_from($crate::LogLevel::Error, $layer, $msg, Some($extra), $crate::caller_function!())
    };
}

/// Log at CRITICAL with the enclosing function captured as the call site.
#[macro_export]
macro_rules! log_critical {
    ($logger:expr, $layer:expr, $msg:expr) => {
        $logger.log_from($crate::LogLevel::Critical, $layer, $msg, None, $crate::caller_function!())
    };
    ($logger:expr, $layer:expr, $msg:expr, $extra:expr) => {
        $logger.log_from($crate::LogLevel::Critical, $layer, $msg, Some($extra), $crate::caller_function!())
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::transport::test_support::RecordingSink;
    use beacon_core::MemoryStore;
    use std::time::Duration;

    fn build_logger(
        transport_level: LogLevel,
        sink: Arc<RecordingSink>,
    ) -> (Logger, Arc<Transport>) {
        let transport = Arc::new(Transport::new(
            TransportConfig {
                batch_size: 100,
                flush_interval_ms: 60_000,
                max_queue: 200,
                request_timeout_ms: 1_000,
                retry_schedule_ms: vec![5],
                max_retries: 1,
            },
            sink,
            vec![],
        ));
        let context = Arc::new(ContextManager::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        ));
        let logger = Logger::new(
            true,
            LoggingConfig {
                transport_level,
                console_level: LogLevel::Critical,
            },
            context,
            Arc::new(Deduplicator::new(Duration::from_secs(10))),
            Arc::clone(&transport),
        );
        (logger, transport)
    }

    #[tokio::test]
    async fn entry_reaches_transport_with_identifiers_and_site() {
        let sink = RecordingSink::new();
        let (logger, transport) = build_logger(LogLevel::Debug, sink.clone());

        logger.info(LogLayer::Service, "user fetched", None);
        transport.flush().await;

        let batches = sink.batches.lock().unwrap();
        let entry = &batches[0][0];
        assert_eq!(entry.message, "user fetched");
        assert_eq!(entry.trace_id.len(), 32);
        assert!(entry.file.ends_with("logger.rs"));
        assert_eq!(entry.function, "unknown");
    }

    #[tokio::test]
    async fn duplicate_within_window_is_enqueued_once() {
        let sink = RecordingSink::new();
        let (logger, transport) = build_logger(LogLevel::Debug, sink.clone());

        logger.info(LogLayer::Service, "x", None);
        logger.info(LogLayer::Service, "x", None);
        transport.flush().await;

        assert_eq!(transport.stats().enqueued, 1);
    }

    #[tokio::test]
    async fn entries_below_transport_threshold_stay_local() {
        let sink = RecordingSink::new();
        let (logger, transport) = build_logger(LogLevel::Warning, sink.clone());

        logger.debug(LogLayer::Component, "render detail", None);
        logger.info(LogLayer::Component, "mounted", None);
        logger.error(LogLayer::Component, "render failed", None);
        transport.flush().await;

        assert_eq!(transport.stats().enqueued, 1);
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches[0][0].message, "render failed");
    }

    #[tokio::test]
    async fn logging_never_panics_on_bad_input() {
        let sink = RecordingSink::new();
        let (logger, transport) = build_logger(LogLevel::Debug, sink.clone());

        // Empty message is a construction defect; the facade degrades
        // it to a diagnostic instead of panicking or enqueueing.
        logger.info(LogLayer::Service, "", None);
        transport.flush().await;

        assert_eq!(transport.stats().enqueued, 0);
    }

    #[tokio::test]
    async fn macro_capture_resolves_function_name() {
        let sink = RecordingSink::new();
        let (logger, transport) = build_logger(LogLevel::Debug, sink.clone());

        log_info!(logger, LogLayer::Hook, "hook fired");
        transport.flush().await;

        let batches = sink.batches.lock().unwrap();
        assert!(batches[0][0]
            .function
            .contains("macro_capture_resolves_function_name"));
    }
}
