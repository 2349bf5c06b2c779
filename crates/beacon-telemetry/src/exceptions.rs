//! Exception pipeline
//!
//! A parallel pipeline for reported errors: classify, deduplicate by a
//! content fingerprint, filter, sanitize, then batch to a dedicated
//! ingestion endpoint with the same bounded-retry discipline as the log
//! transport. Filtering runs *after* deduplication so a high-frequency
//! duplicate cannot drain the throttle budget. A hard per-session cap
//! bounds worst-case volume during an error storm.

use crate::classify::{classify, Classification, ErrorCategory, FailureKind};
use crate::config::ExceptionConfig;
use crate::dedup::SlidingWindow;
use crate::entry::{LogLevel, TIMESTAMP_FORMAT};
use crate::Result;
use async_trait::async_trait;
use beacon_core::ContextManager;
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Context keys stripped during sanitization.
const SENSITIVE_KEYS: &[&str] = &[
    "storage",
    "token",
    "authorization",
    "cookie",
    "password",
    "secret",
];

/// Normalized view of a reported error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedError {
    pub name: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Request/UI context travelling with a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExceptionContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

/// A reported error, ready for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub id: Uuid,
    pub error: NormalizedError,
    pub context: ExceptionContext,
    pub classification: Classification,
    pub occurred_at: String,
}

/// Dedup fingerprint: name, message, url, first three stack lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExceptionKey {
    name: String,
    message: String,
    url: Option<String>,
    stack_head: String,
}

impl ExceptionKey {
    fn new(name: &str, message: &str, url: Option<&str>, stack: Option<&str>) -> Self {
        let stack_head = stack
            .map(|stack| {
                stack
                    .lines()
                    .take(3)
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        Self {
            name: name.to_string(),
            message: message.to_string(),
            url: url.map(str::to_string),
            stack_head,
        }
    }
}

/// Delivery seam for exception batches.
#[async_trait]
pub trait ExceptionSink: Send + Sync {
    async fn send(&self, batch: &[ExceptionRecord], metadata: &Value) -> Result<()>;
}

/// POSTs `{ exceptions, metadata }` to the exception ingestion endpoint.
pub struct HttpExceptionSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpExceptionSink {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }
}

#[async_trait]
impl ExceptionSink for HttpExceptionSink {
    async fn send(&self, batch: &[ExceptionRecord], metadata: &Value) -> Result<()> {
        let body = serde_json::json!({
            "exceptions": batch,
            "metadata": metadata,
        });

        let response = tokio::time::timeout(
            self.timeout,
            self.client.post(&self.url).json(&body).send(),
        )
        .await
        .map_err(|_| crate::Error::SendTimeout {
            timeout_ms: self.timeout.as_millis() as u64,
        })??;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(crate::Error::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

/// Cumulative reporter counters.
#[derive(Default)]
pub struct ReporterStats {
    reported: AtomicU64,
    suppressed: AtomicU64,
    filtered: AtomicU64,
    sampled_out: AtomicU64,
    capped: AtomicU64,
    enqueued: AtomicU64,
    sent_batches: AtomicU64,
    permanently_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReporterStatsSnapshot {
    pub reported: u64,
    pub suppressed: u64,
    pub filtered: u64,
    pub sampled_out: u64,
    pub capped: u64,
    pub enqueued: u64,
    pub sent_batches: u64,
    pub permanently_failed: u64,
}

impl ReporterStats {
    fn snapshot(&self) -> ReporterStatsSnapshot {
        ReporterStatsSnapshot {
            reported: self.reported.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            sampled_out: self.sampled_out.load(Ordering::Relaxed),
            capped: self.capped.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent_batches: self.sent_batches.load(Ordering::Relaxed),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
        }
    }
}

/// The exception reporter. Construct inside a tokio runtime; the
/// interval flusher starts immediately and runs until [`ExceptionReporter::shutdown`].
pub struct ExceptionReporter {
    config: ExceptionConfig,
    sink: Arc<dyn ExceptionSink>,
    context: Arc<ContextManager>,
    window: Arc<SlidingWindow<ExceptionKey>>,
    queue: Arc<Mutex<VecDeque<ExceptionRecord>>>,
    stats: Arc<ReporterStats>,
    in_flight: Arc<AtomicUsize>,
    accepted: AtomicUsize,
    cancel: CancellationToken,
}

impl ExceptionReporter {
    pub fn new(
        config: ExceptionConfig,
        sink: Arc<dyn ExceptionSink>,
        context: Arc<ContextManager>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let window = Arc::new(SlidingWindow::new(config.window()));
        let _ = window.spawn_sweeper(config.window(), cancel.clone());

        let reporter = Arc::new(Self {
            config,
            sink,
            context,
            window,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            stats: Arc::new(ReporterStats::default()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            accepted: AtomicUsize::new(0),
            cancel,
        });
        reporter.spawn_interval_flusher();
        reporter
    }

    /// Report any error value. Non-blocking, infallible at the caller.
    pub fn report(&self, error: &(dyn std::error::Error + 'static), context: ExceptionContext) {
        self.report_parts("error", &error.to_string(), None, context, None);
    }

    /// Report with explicit parts; used by the API client (which has a
    /// classification already) and the panic hook.
    pub fn report_parts(
        &self,
        name: &str,
        message: &str,
        stack: Option<&str>,
        context: ExceptionContext,
        classification: Option<Classification>,
    ) {
        self.stats.reported.fetch_add(1, Ordering::Relaxed);

        if self.accepted.load(Ordering::SeqCst) >= self.config.session_cap {
            self.stats.capped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let classification = classification.unwrap_or_else(|| classify(&FailureKind::Other));

        let key = ExceptionKey::new(name, message, context.url.as_deref(), stack);
        if !self.window.accept(key) {
            self.stats.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }

        // Filters run after dedup so duplicates cannot consume the
        // throttle budget.
        if self.config.drop_messages.iter().any(|noise| noise == message) {
            self.stats.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.is_throttled(&classification) {
            self.stats.sampled_out.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let record = ExceptionRecord {
            id: Uuid::new_v4(),
            error: NormalizedError {
                name: name.to_string(),
                message: message.to_string(),
                stack: stack.map(|stack| truncate(stack, self.config.max_stack_len)),
            },
            context: sanitize_context(context),
            classification,
            occurred_at: Utc::now().format(TIMESTAMP_FORMAT).to_string(),
        };

        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.enqueue(record);
    }

    /// Network-category and low-impact records keep only a sampled
    /// fraction; everything at ERROR and above in other categories
    /// passes untouched.
    fn is_throttled(&self, classification: &Classification) -> bool {
        let low_impact = classification.severity.value() < LogLevel::Error.value();
        if classification.category != ErrorCategory::NetworkError && !low_impact {
            return false;
        }
        rand::thread_rng().gen::<f64>() >= self.config.network_sample_rate
    }

    fn enqueue(&self, record: ExceptionRecord) {
        let batch = {
            let mut queue = match self.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };

            queue.push_back(record);
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);

            while queue.len() > self.config.max_queue {
                queue.pop_front();
                metrics::counter!("beacon_exception_records_dropped_total").increment(1);
            }

            if queue.len() >= self.config.batch_size {
                Some(queue.drain(..).collect::<Vec<_>>())
            } else {
                None
            }
        };

        if let Some(batch) = batch {
            self.spawn_delivery(batch);
        }
    }

    /// Force-send pending records and wait for in-flight batches to
    /// resolve.
    pub async fn flush(&self) {
        let batch: Vec<ExceptionRecord> = {
            let mut queue = match self.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.drain(..).collect()
        };

        if !batch.is_empty() {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            deliver(
                Arc::clone(&self.sink),
                batch,
                self.metadata(),
                self.config.clone(),
                Arc::clone(&self.stats),
                Arc::clone(&self.in_flight),
                self.cancel.clone(),
            )
            .await;
        }

        while self.in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn shutdown(&self) {
        self.flush().await;
        self.cancel.cancel();
    }

    pub fn stats(&self) -> ReporterStatsSnapshot {
        self.stats.snapshot()
    }

    fn metadata(&self) -> Value {
        serde_json::json!({
            "source": crate::entry::SOURCE,
            "trace_id": self.context.trace_id(),
            "sent_at": Utc::now().format(TIMESTAMP_FORMAT).to_string(),
        })
    }

    fn spawn_delivery(&self, batch: Vec<ExceptionRecord>) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let sink = Arc::clone(&self.sink);
        let metadata = self.metadata();
        let config = self.config.clone();
        let stats = Arc::clone(&self.stats);
        let in_flight = Arc::clone(&self.in_flight);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            deliver(sink, batch, metadata, config, stats, in_flight, cancel).await;
        });
    }

    fn spawn_interval_flusher(self: &Arc<Self>) {
        let reporter = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reporter.config.flush_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let batch: Vec<ExceptionRecord> = {
                            let mut queue = match reporter.queue.lock() {
                                Ok(queue) => queue,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            queue.drain(..).collect()
                        };
                        if !batch.is_empty() {
                            reporter.spawn_delivery(batch);
                        }
                    }
                }
            }
        });
    }
}

/// Route panics into the reporter, capped like every other source. The
/// previous hook still runs.
pub fn install_panic_hook(reporter: Arc<ExceptionReporter>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };

        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()));

        reporter.report_parts(
            "panic",
            &message,
            location.as_deref(),
            ExceptionContext::default(),
            None,
        );

        previous(info);
    }));
}

async fn deliver(
    sink: Arc<dyn ExceptionSink>,
    batch: Vec<ExceptionRecord>,
    metadata: Value,
    config: ExceptionConfig,
    stats: Arc<ReporterStats>,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut retry_count = 0usize;

    loop {
        match sink.send(&batch, &metadata).await {
            Ok(()) => {
                stats.sent_batches.fetch_add(1, Ordering::Relaxed);
                break;
            }
            Err(last_error) => {
                if retry_count >= config.max_retries {
                    stats.permanently_failed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("beacon_exception_batches_failed_total").increment(1);
                    warn!(
                        records = batch.len(),
                        retries = retry_count,
                        error = %last_error,
                        "exception batch permanently failed"
                    );
                    break;
                }

                let delay = config.retry_delay(retry_count);
                retry_count += 1;
                debug!(
                    attempt = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "exception batch send failed, backing off"
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        stats.permanently_failed.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    in_flight.fetch_sub(1, Ordering::SeqCst);
}

fn truncate(value: &str, max_len: usize) -> String {
    if value.len() <= max_len {
        value.to_string()
    } else {
        let mut end = max_len;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value[..end].to_string()
    }
}

/// Strip known-sensitive keys from the free-form context payload.
fn sanitize_context(mut context: ExceptionContext) -> ExceptionContext {
    if let Some(extra) = context.extra.as_mut() {
        strip_sensitive(extra);
    }
    context
}

fn strip_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| {
                let key = key.to_lowercase();
                !SENSITIVE_KEYS.iter().any(|needle| key.contains(needle))
            });
            for nested in map.values_mut() {
                strip_sensitive(nested);
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                strip_sensitive(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub struct RecordingExceptionSink {
        pub batches: Mutex<Vec<(Vec<ExceptionRecord>, Value)>>,
        pub attempts: AtomicUsize,
        pub fail_first: AtomicUsize,
    }

    impl RecordingExceptionSink {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(Vec::new()),
                attempts: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            })
        }

        pub fn records(&self) -> Vec<ExceptionRecord> {
            self.batches
                .lock()
                .unwrap()
                .iter()
                .flat_map(|(batch, _)| batch.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ExceptionSink for RecordingExceptionSink {
        async fn send(&self, batch: &[ExceptionRecord], metadata: &Value) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first.load(Ordering::SeqCst) {
                return Err(crate::Error::Rejected { status: 502 });
            }
            self.batches
                .lock()
                .unwrap()
                .push((batch.to_vec(), metadata.clone()));
            Ok(())
        }
    }
}
