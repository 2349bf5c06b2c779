//! Telemetry system lifecycle
//!
//! One [`TelemetrySystem`] is created at application start and shut
//! down (flushed, tasks cancelled) at application exit or test
//! teardown. Every component is an explicitly constructed instance
//! owned here; there are no ambient globals.

use crate::config::TelemetryConfig;
use crate::dedup::Deduplicator;
use crate::exceptions::{ExceptionReporter, HttpExceptionSink};
use crate::logger::Logger;
use crate::transport::{HttpLogSink, Transport};
use beacon_core::{ContextManager, FileStore, StateStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct TelemetrySystem {
    context: Arc<ContextManager>,
    dedup: Arc<Deduplicator>,
    transport: Arc<Transport>,
    logger: Arc<Logger>,
    exceptions: Arc<ExceptionReporter>,
    cancel: CancellationToken,
}

impl TelemetrySystem {
    /// Wire the full pipeline with file-backed stores. Must be called
    /// inside a tokio runtime; background tasks start immediately.
    pub fn init(config: TelemetryConfig) -> Self {
        Self::init_with_stores(
            config,
            Arc::new(FileStore::session("beacon")),
            Arc::new(FileStore::durable("beacon")),
        )
    }

    /// Wire the pipeline with explicit stores (tests use in-memory ones).
    pub fn init_with_stores(
        mut config: TelemetryConfig,
        session: Arc<dyn StateStore>,
        durable: Arc<dyn StateStore>,
    ) -> Self {
        // Disabling telemetry silences both pipelines without changing
        // any call sites: the logger short-circuits and the reporter's
        // session budget is zero.
        if !config.enabled {
            config.exceptions.session_cap = 0;
        }

        let cancel = CancellationToken::new();
        let context = Arc::new(ContextManager::new(session, durable));

        let dedup = Arc::new(Deduplicator::new(config.dedup.window()));
        let _ = dedup.spawn_sweeper(config.dedup.sweep_interval(), cancel.clone());

        let transport = Arc::new(Transport::new(
            config.transport.clone(),
            Arc::new(HttpLogSink::new(
                config.endpoints.log_url.clone(),
                config.transport.request_timeout(),
            )),
            vec![
                config.endpoints.log_url.clone(),
                config.endpoints.exception_url.clone(),
            ],
        ));

        let logger = Arc::new(Logger::new(
            config.enabled,
            config.logging.clone(),
            Arc::clone(&context),
            Arc::clone(&dedup),
            Arc::clone(&transport),
        ));

        let exceptions = ExceptionReporter::new(
            config.exceptions.clone(),
            Arc::new(HttpExceptionSink::new(
                config.endpoints.exception_url.clone(),
                config.transport.request_timeout(),
            )),
            Arc::clone(&context),
        );

        Self {
            context,
            dedup,
            transport,
            logger,
            exceptions,
            cancel,
        }
    }

    pub fn logger(&self) -> &Arc<Logger> {
        &self.logger
    }

    pub fn exceptions(&self) -> &Arc<ExceptionReporter> {
        &self.exceptions
    }

    pub fn context(&self) -> &Arc<ContextManager> {
        &self.context
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn dedup(&self) -> &Arc<Deduplicator> {
        &self.dedup
    }

    /// Flush both pipelines, then cancel every background task.
    pub async fn shutdown(&self) {
        futures::join!(self.transport.shutdown(), self.exceptions.shutdown());
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::MemoryStore;

    #[tokio::test]
    async fn init_and_shutdown_cycle() {
        let system = TelemetrySystem::init_with_stores(
            TelemetryConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        );

        assert_eq!(system.context().trace_id().len(), 32);
        system.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_system_produces_nothing() {
        let mut config = TelemetryConfig::default();
        config.enabled = false;

        let system = TelemetrySystem::init_with_stores(
            config,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        );

        system
            .logger()
            .error(crate::LogLayer::Service, "ignored", None);
        system.exceptions().report_parts(
            "Error",
            "ignored",
            None,
            Default::default(),
            None,
        );
        system.shutdown().await;

        assert_eq!(system.transport().stats().enqueued, 0);
        assert_eq!(system.exceptions().stats().enqueued, 0);
    }
}
