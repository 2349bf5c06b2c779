//! Time-windowed suppression of repeated events
//!
//! Sliding acceptance: each accepted sighting restamps its key, so a
//! key only passes again once a full window has elapsed since the last
//! acceptance. A background sweep evicts aged-out keys to bound memory.

use crate::entry::LogEntry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Generic windowed acceptance set. The log and exception pipelines
/// each hold their own instance with independent windows.
pub struct SlidingWindow<K> {
    window: Duration,
    seen: Mutex<HashMap<K, Instant>>,
}

impl<K: Eq + Hash + Clone + Send + 'static> SlidingWindow<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Accept the key unless an identical key was accepted within the
    /// window. Acceptance restamps the key (sliding, not fixed-bucket).
    pub fn accept(&self, key: K) -> bool {
        let now = Instant::now();
        let mut seen = match self.seen.lock() {
            Ok(seen) => seen,
            Err(poisoned) => poisoned.into_inner(),
        };

        match seen.get(&key) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                seen.insert(key, now);
                true
            }
        }
    }

    /// Evict keys whose last acceptance has aged out of the window.
    pub fn sweep(&self) {
        let now = Instant::now();
        let window = self.window;
        if let Ok(mut seen) = self.seen.lock() {
            seen.retain(|_, last| now.duration_since(*last) < window);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.lock().map(|seen| seen.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic sweep task; stops when the token is cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let window = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => window.sweep(),
                }
            }
        })
    }
}

/// Content key for log entries: deliberately excludes `created_at` and
/// `request_id` so truly repeated events collapse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    level: crate::LogLevel,
    layer: crate::LogLayer,
    message: String,
    file: String,
    function: String,
    extra: Option<String>,
}

impl From<&LogEntry> for EntryKey {
    fn from(entry: &LogEntry) -> Self {
        Self {
            level: entry.level,
            layer: entry.layer,
            message: entry.message.clone(),
            file: entry.file.clone(),
            function: entry.function.clone(),
            extra: entry.extra_data.as_ref().map(|value| value.to_string()),
        }
    }
}

/// Log-entry deduplicator with a background sweep.
pub struct Deduplicator {
    window: Arc<SlidingWindow<EntryKey>>,
}

impl Deduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window: Arc::new(SlidingWindow::new(window)),
        }
    }

    /// Whether the entry should proceed down the pipeline.
    pub fn should_log(&self, entry: &LogEntry) -> bool {
        self.window.accept(EntryKey::from(entry))
    }

    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        self.window.spawn_sweeper(interval, cancel)
    }

    pub fn tracked_keys(&self) -> usize {
        self.window.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{CallSite, LogLayer, LogLevel};

    fn entry(message: &str) -> LogEntry {
        LogEntry::new(
            LogLevel::Info,
            LogLayer::Service,
            message,
            CallSite {
                file: "src/api.rs".to_string(),
                line: 10,
                function: "api::fetch".to_string(),
            },
            "0123456789abcdef0123456789abcdef",
            None,
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn second_sighting_within_window_is_suppressed() {
        let dedup = Deduplicator::new(Duration::from_secs(10));
        let event = entry("duplicate me");

        assert!(dedup.should_log(&event));
        assert!(!dedup.should_log(&event));
    }

    #[test]
    fn sighting_past_the_window_is_accepted_again() {
        let dedup = Deduplicator::new(Duration::from_millis(30));
        let event = entry("rare event");

        assert!(dedup.should_log(&event));
        std::thread::sleep(Duration::from_millis(60));
        assert!(dedup.should_log(&event));
    }

    #[test]
    fn differing_request_ids_still_collapse() {
        let dedup = Deduplicator::new(Duration::from_secs(10));
        let mut first = entry("same content");
        let mut second = entry("same content");
        first.request_id = Some("t-001".to_string());
        second.request_id = Some("t-002".to_string());

        assert!(dedup.should_log(&first));
        assert!(!dedup.should_log(&second));
    }

    #[test]
    fn differing_extra_data_does_not_collapse() {
        let dedup = Deduplicator::new(Duration::from_secs(10));
        let mut first = entry("payload event");
        let mut second = entry("payload event");
        first.extra_data = Some(serde_json::json!({"attempt": 1}));
        second.extra_data = Some(serde_json::json!({"attempt": 2}));

        assert!(dedup.should_log(&first));
        assert!(dedup.should_log(&second));
    }

    #[test]
    fn sweep_evicts_aged_keys_and_bounds_memory() {
        let dedup = Deduplicator::new(Duration::from_millis(20));
        for i in 0..50 {
            dedup.should_log(&entry(&format!("event {i}")));
        }
        assert_eq!(dedup.tracked_keys(), 50);

        std::thread::sleep(Duration::from_millis(40));
        dedup.window.sweep();
        assert_eq!(dedup.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn sweeper_task_stops_on_cancellation() {
        let dedup = Deduplicator::new(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = dedup.spawn_sweeper(Duration::from_millis(5), cancel.clone());

        dedup.should_log(&entry("short lived"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(dedup.tracked_keys(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }
}
