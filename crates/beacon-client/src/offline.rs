//! Offline write queue
//!
//! Non-GET requests issued while connectivity is down land here and
//! the caller gets an immediate, distinguishable `Queued` rejection.
//! On reconnect the queue replays FIFO with a small delay between
//! items; items past the staleness ceiling are skipped, and an item
//! that keeps failing is dropped once its replay budget is spent. A
//! best-effort durable mirror preserves the queue across restarts.

use crate::client::{ApiRequest, Dispatcher};
use crate::config::OfflineConfig;
use beacon_core::StateStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const SNAPSHOT_KEY: &str = "offline_queue";

/// A request captured while offline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub request: ApiRequest,
    pub queued_at_ms: i64,
    pub retry_count: u32,
}

/// What one replay pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub replayed: usize,
    pub skipped_stale: usize,
    pub dropped: usize,
    pub requeued: usize,
}

pub struct OfflineQueue {
    config: OfflineConfig,
    items: Mutex<VecDeque<QueuedRequest>>,
    store: Option<Arc<dyn StateStore>>,
}

impl OfflineQueue {
    pub fn new(config: OfflineConfig, store: Option<Arc<dyn StateStore>>) -> Self {
        let items = store
            .as_ref()
            .and_then(|store| store.get(SNAPSHOT_KEY))
            .and_then(|serialized| serde_json::from_str(&serialized).ok())
            .unwrap_or_default();

        Self {
            config,
            items: Mutex::new(items),
            store,
        }
    }

    /// Append a request, dropping the oldest past the bound. Returns
    /// the capture timestamp echoed in the `Queued` rejection.
    pub fn enqueue(&self, request: ApiRequest) -> i64 {
        let queued_at_ms = Utc::now().timestamp_millis();
        let snapshot = {
            let mut items = self.lock();
            items.push_back(QueuedRequest {
                request,
                queued_at_ms,
                retry_count: 0,
            });

            while items.len() > self.config.max_queue {
                items.pop_front();
                metrics::counter!("beacon_offline_requests_dropped_total").increment(1);
            }

            items.clone()
        };

        self.persist(&snapshot);
        queued_at_ms
    }

    /// Replay the queue FIFO. Each queued item gets one dispatch per
    /// pass; failures consume the item's replay budget and requeue at
    /// the tail until the budget is spent.
    pub async fn replay(&self, dispatcher: &Arc<dyn Dispatcher>) -> ReplayOutcome {
        let mut outcome = ReplayOutcome::default();
        let pass_len = self.len();

        for index in 0..pass_len {
            let Some(mut item) = self.pop_front() else {
                break;
            };

            let age_ms = Utc::now().timestamp_millis() - item.queued_at_ms;
            if age_ms > self.config.staleness_ceiling_ms as i64 {
                outcome.skipped_stale += 1;
                debug!(url = %item.request.url, age_ms, "skipping stale offline request");
                continue;
            }

            if index > 0 {
                tokio::time::sleep(self.config.replay_delay()).await;
            }

            match dispatcher.dispatch(&item.request).await {
                Ok(_) => outcome.replayed += 1,
                Err(error) => {
                    item.retry_count += 1;
                    if item.retry_count >= self.config.replay_attempts {
                        outcome.dropped += 1;
                        metrics::counter!("beacon_offline_replays_failed_total").increment(1);
                        warn!(
                            url = %item.request.url,
                            retries = item.retry_count,
                            %error,
                            "offline request dropped after exhausting replay budget"
                        );
                    } else {
                        outcome.requeued += 1;
                        self.push_back(item);
                    }
                }
            }
        }

        self.persist(&self.lock().clone());
        outcome
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued requests, oldest first.
    pub fn snapshot(&self) -> Vec<QueuedRequest> {
        self.lock().iter().cloned().collect()
    }

    fn pop_front(&self) -> Option<QueuedRequest> {
        self.lock().pop_front()
    }

    fn push_back(&self, item: QueuedRequest) {
        self.lock().push_back(item);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<QueuedRequest>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, items: &VecDeque<QueuedRequest>) {
        if let Some(store) = &self.store {
            match serde_json::to_string(items) {
                Ok(serialized) => store.set(SNAPSHOT_KEY, &serialized),
                Err(error) => tracing::debug!(%error, "offline queue snapshot failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDispatcher;

    fn config() -> OfflineConfig {
        OfflineConfig {
            max_queue: 5,
            staleness_ceiling_ms: 60_000,
            replay_attempts: 3,
            replay_delay_ms: 1,
        }
    }

    fn post(url: &str) -> ApiRequest {
        ApiRequest::post(url, serde_json::json!({"n": 1}))
    }

    #[test]
    fn queue_bound_drops_oldest() {
        let queue = OfflineQueue::new(config(), None);
        for i in 0..8 {
            queue.enqueue(post(&format!("/writes/{i}")));
        }

        assert_eq!(queue.len(), 5);
        assert_eq!(queue.snapshot()[0].request.url, "/writes/3");
    }

    #[tokio::test]
    async fn replay_preserves_fifo_order() {
        let queue = OfflineQueue::new(config(), None);
        queue.enqueue(post("/writes/a"));
        queue.enqueue(post("/writes/b"));
        queue.enqueue(post("/writes/c"));

        let dispatcher = MockDispatcher::new();
        let dispatch: Arc<dyn Dispatcher> = dispatcher.clone();
        let outcome = queue.replay(&dispatch).await;

        assert_eq!(outcome.replayed, 3);
        assert!(queue.is_empty());

        let urls: Vec<String> = dispatcher
            .calls()
            .iter()
            .map(|request| request.url.clone())
            .collect();
        assert_eq!(urls, vec!["/writes/a", "/writes/b", "/writes/c"]);
    }

    #[tokio::test]
    async fn stale_items_are_skipped_on_replay() {
        let queue = OfflineQueue::new(config(), None);
        queue.enqueue(post("/writes/old"));
        queue.enqueue(post("/writes/new"));

        // Age the first item past the ceiling.
        {
            let mut items = queue.lock();
            items[0].queued_at_ms -= 120_000;
        }

        let dispatcher = MockDispatcher::new();
        let dispatch: Arc<dyn Dispatcher> = dispatcher.clone();
        let outcome = queue.replay(&dispatch).await;

        assert_eq!(outcome.skipped_stale, 1);
        assert_eq!(outcome.replayed, 1);
        assert_eq!(dispatcher.calls()[0].url, "/writes/new");
    }

    #[tokio::test]
    async fn failing_item_requeues_until_budget_is_spent() {
        let queue = OfflineQueue::new(config(), None);
        queue.enqueue(post("/writes/doomed"));

        let dispatcher = MockDispatcher::new();
        dispatcher.fail_always(crate::ApiError::Network {
            message: "still down".to_string(),
        });

        let dispatch: Arc<dyn Dispatcher> = dispatcher.clone();
        let first = queue.replay(&dispatch).await;
        assert_eq!(first.requeued, 1);
        assert_eq!(queue.len(), 1);

        let second = queue.replay(&dispatch).await;
        assert_eq!(second.requeued, 1);

        let third = queue.replay(&dispatch).await;
        assert_eq!(third.dropped, 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_persists_and_rehydrates() {
        let store: Arc<dyn StateStore> = Arc::new(beacon_core::MemoryStore::new());
        let queue = OfflineQueue::new(config(), Some(Arc::clone(&store)));
        queue.enqueue(post("/writes/survivor"));
        drop(queue);

        let reborn = OfflineQueue::new(config(), Some(store));
        assert_eq!(reborn.len(), 1);
        assert_eq!(reborn.snapshot()[0].request.url, "/writes/survivor");
    }
}
