//! Batching log transport
//!
//! Entries accumulate in a bounded in-memory queue and are cut into
//! batches on a size or interval trigger, whichever fires first. Failed
//! batches retry on a fixed backoff schedule and are dropped once the
//! retry budget is exhausted; delivery faults never propagate to the
//! producers. Requests about the ingestion endpoints themselves are
//! rejected before enqueue so the pipeline cannot feed itself.

use crate::config::TransportConfig;
use crate::entry::{LogEntry, WireLogEntry, TIMESTAMP_FORMAT};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Delivery seam for log batches. The HTTP implementation posts to the
/// ingestion endpoint; tests substitute recording or failing sinks.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn send(&self, batch: &[LogEntry]) -> Result<()>;
}

/// POSTs batches as JSON to the log ingestion endpoint.
pub struct HttpLogSink {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpLogSink {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            timeout,
        }
    }
}

#[async_trait]
impl LogSink for HttpLogSink {
    async fn send(&self, batch: &[LogEntry]) -> Result<()> {
        let body = serde_json::json!({
            "logs": batch.iter().map(WireLogEntry::from).collect::<Vec<_>>(),
            "timestamp": Utc::now().format(TIMESTAMP_FORMAT).to_string(),
            "batch_size": batch.len(),
        });

        let response = tokio::time::timeout(
            self.timeout,
            self.client.post(&self.url).json(&body).send(),
        )
        .await
        .map_err(|_| Error::SendTimeout {
            timeout_ms: self.timeout.as_millis() as u64,
        })??;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::Rejected {
                status: status.as_u16(),
            })
        }
    }
}

/// Cumulative transport counters.
#[derive(Default)]
pub struct TransportStats {
    enqueued: AtomicU64,
    sent_batches: AtomicU64,
    sent_entries: AtomicU64,
    dropped: AtomicU64,
    retried: AtomicU64,
    permanently_failed: AtomicU64,
}

/// Point-in-time view of [`TransportStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStatsSnapshot {
    pub enqueued: u64,
    pub sent_batches: u64,
    pub sent_entries: u64,
    pub dropped: u64,
    pub retried: u64,
    pub permanently_failed: u64,
}

impl TransportStats {
    pub fn snapshot(&self) -> TransportStatsSnapshot {
        TransportStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            sent_batches: self.sent_batches.load(Ordering::Relaxed),
            sent_entries: self.sent_entries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            permanently_failed: self.permanently_failed.load(Ordering::Relaxed),
        }
    }
}

/// The batching queue. Must be constructed inside a tokio runtime; the
/// interval flusher starts immediately and runs until [`Transport::shutdown`].
pub struct Transport {
    config: TransportConfig,
    sink: Arc<dyn LogSink>,
    queue: Arc<Mutex<VecDeque<LogEntry>>>,
    stats: Arc<TransportStats>,
    /// Batches cut but not yet resolved (delivered or dropped).
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
    /// Ingestion endpoints; entries referencing them are never enqueued.
    guarded_urls: Vec<String>,
}

impl Transport {
    pub fn new(config: TransportConfig, sink: Arc<dyn LogSink>, guarded_urls: Vec<String>) -> Self {
        let transport = Self {
            config,
            sink,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            stats: Arc::new(TransportStats::default()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancel: CancellationToken::new(),
            guarded_urls,
        };
        transport.spawn_interval_flusher();
        transport
    }

    /// Push an entry; cuts and sends a batch when the queue reaches the
    /// configured batch size. Oldest entries are dropped past the queue
    /// bound.
    pub fn enqueue(&self, entry: LogEntry) {
        if self.references_ingestion_endpoint(&entry) {
            debug!("discarding entry about the ingestion endpoint itself");
            return;
        }

        let batch = {
            let mut queue = match self.queue.lock() {
                Ok(queue) => queue,
                Err(poisoned) => poisoned.into_inner(),
            };

            queue.push_back(entry);
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);

            while queue.len() > self.config.max_queue {
                queue.pop_front();
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("beacon_log_entries_dropped_total").increment(1);
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

    /// Force-send the current queue, then wait for every cut batch to
    /// resolve (delivered or dropped after its retry budget).
    pub async fn flush(&self) {
        let batch = self.cut_queue();
        if !batch.is_empty() {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            deliver(
                Arc::clone(&self.sink),
                batch,
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

    /// Final flush, then cancel the background tasks.
    pub async fn shutdown(&self) {
        self.flush().await;
        self.cancel.cancel();
    }

    pub fn stats(&self) -> TransportStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    fn references_ingestion_endpoint(&self, entry: &LogEntry) -> bool {
        self.guarded_urls.iter().any(|url| {
            entry.message.contains(url)
                || entry
                    .extra_data
                    .as_ref()
                    .is_some_and(|extra| extra.to_string().contains(url))
        })
    }

    fn cut_queue(&self) -> Vec<LogEntry> {
        let mut queue = match self.queue.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.drain(..).collect()
    }

    fn spawn_delivery(&self, batch: Vec<LogEntry>) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let sink = Arc::clone(&self.sink);
        let config = self.config.clone();
        let stats = Arc::clone(&self.stats);
        let in_flight = Arc::clone(&self.in_flight);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            deliver(sink, batch, config, stats, in_flight, cancel).await;
        });
    }

    fn spawn_interval_flusher(&self) {
        let queue = Arc::clone(&self.queue);
        let sink = Arc::clone(&self.sink);
        let config = self.config.clone();
        let stats = Arc::clone(&self.stats);
        let in_flight = Arc::clone(&self.in_flight);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.flush_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so the
            // first interval flush happens one period from startup.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let batch: Vec<LogEntry> = {
                            let mut queue = match queue.lock() {
                                Ok(queue) => queue,
                                Err(poisoned) => poisoned.into_inner(),
                            };
                            queue.drain(..).collect()
                        };

                        if !batch.is_empty() {
                            in_flight.fetch_add(1, Ordering::SeqCst);
                            let sink = Arc::clone(&sink);
                            let config = config.clone();
                            let stats = Arc::clone(&stats);
                            let in_flight = Arc::clone(&in_flight);
                            let cancel = cancel.clone();
                            tokio::spawn(async move {
                                deliver(sink, batch, config, stats, in_flight, cancel).await;
                            });
                        }
                    }
                }
            }
        });
    }
}

/// Send one batch with bounded backoff retry. Resolves the in-flight
/// counter exactly once, whatever the outcome.
async fn deliver(
    sink: Arc<dyn LogSink>,
    batch: Vec<LogEntry>,
    config: TransportConfig,
    stats: Arc<TransportStats>,
    in_flight: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut retry_count = 0usize;

    loop {
        match sink.send(&batch).await {
            Ok(()) => {
                stats.sent_batches.fetch_add(1, Ordering::Relaxed);
                stats
                    .sent_entries
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                break;
            }
            Err(last_error) => {
                if retry_count >= config.max_retries {
                    stats.permanently_failed.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("beacon_log_batches_failed_total").increment(1);
                    warn!(
                        entries = batch.len(),
                        retries = retry_count,
                        error = %last_error,
                        "log batch permanently failed"
                    );
                    break;
                }

                let delay = config.retry_delay(retry_count);
                retry_count += 1;
                stats.retried.fetch_add(1, Ordering::Relaxed);
                debug!(
                    attempt = retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "log batch send failed, backing off"
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
