//! GET response cache
//!
//! Keyed by `(method, url, serialized params)`. Entries carry an
//! absolute expiry; `get_fresh` lazily evicts on lookup and a sweep
//! task evicts periodically. `get_any` returns entries regardless of
//! expiry — that path exists only for the stale-fallback recovery in
//! the client and its results must be flagged `is_stale` by the caller.
//! A best-effort mirror in the durable store lets a restart begin with
//! a warm cache; losing it is harmless.

use crate::config::CacheConfig;
use beacon_core::StateStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const SNAPSHOT_KEY: &str = "response_cache";

/// One cached GET response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    pub body: Value,
    pub stored_at_ms: i64,
    pub expires_at_ms: i64,
}

impl CacheEntry {
    pub fn is_fresh(&self) -> bool {
        Utc::now().timestamp_millis() < self.expires_at_ms
    }
}

pub struct ResponseCache {
    config: CacheConfig,
    entries: Mutex<HashMap<String, CacheEntry>>,
    store: Option<Arc<dyn StateStore>>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, store: Option<Arc<dyn StateStore>>) -> Self {
        let entries = match (&store, config.persist) {
            (Some(store), true) => rehydrate(store.as_ref()),
            _ => HashMap::new(),
        };

        Self {
            config,
            entries: Mutex::new(entries),
            store,
        }
    }

    /// Fresh entry for the key, lazily evicting it when expired.
    pub fn get_fresh(&self, key: &str) -> Option<CacheEntry> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.is_fresh() => Some(entry.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Any entry for the key, expired or not. Stale-fallback only.
    pub fn get_any(&self, key: &str) -> Option<CacheEntry> {
        self.lock().get(key).cloned()
    }

    pub fn insert(&self, key: &str, status: u16, body: Value) {
        let now = Utc::now().timestamp_millis();
        let entry = CacheEntry {
            status,
            body,
            stored_at_ms: now,
            expires_at_ms: now + self.config.ttl_ms as i64,
        };

        let snapshot = {
            let mut entries = self.lock();
            entries.insert(key.to_string(), entry);

            while entries.len() > self.config.max_entries {
                let victim = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.expires_at_ms)
                    .map(|(key, _)| key.clone());
                match victim {
                    Some(victim) => entries.remove(&victim),
                    None => break,
                };
            }

            self.config.persist.then(|| entries.clone())
        };

        if let Some(snapshot) = snapshot {
            self.persist(&snapshot);
        }
    }

    /// Evict every expired entry.
    pub fn sweep(&self) {
        let now = Utc::now().timestamp_millis();
        let snapshot = {
            let mut entries = self.lock();
            let before = entries.len();
            entries.retain(|_, entry| entry.expires_at_ms > now);
            (self.config.persist && entries.len() != before).then(|| entries.clone())
        };

        if let Some(snapshot) = snapshot {
            self.persist(&snapshot);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodic sweep task; stops when the token is cancelled.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) {
        let cache = Arc::clone(self);
        let interval = cache.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => cache.sweep(),
                }
            }
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn persist(&self, entries: &HashMap<String, CacheEntry>) {
        if let Some(store) = &self.store {
            match serde_json::to_string(entries) {
                Ok(serialized) => store.set(SNAPSHOT_KEY, &serialized),
                Err(error) => tracing::debug!(%error, "cache snapshot serialization failed"),
            }
        }
    }
}

fn rehydrate(store: &dyn StateStore) -> HashMap<String, CacheEntry> {
    store
        .get(SNAPSHOT_KEY)
        .and_then(|serialized| serde_json::from_str(&serialized).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::MemoryStore;
    use std::time::Duration;

    fn config(ttl_ms: u64) -> CacheConfig {
        CacheConfig {
            ttl_ms,
            sweep_interval_ms: 60_000,
            max_entries: 10,
            persist: false,
        }
    }

    #[test]
    fn fresh_entry_round_trips_until_ttl() {
        let cache = ResponseCache::new(config(30), None);
        cache.insert("GET /users", 200, serde_json::json!({"users": []}));

        assert!(cache.get_fresh("GET /users").is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(cache.get_fresh("GET /users").is_none());
        // Lazy eviction removed it entirely.
        assert!(cache.is_empty());
    }

    #[test]
    fn stale_entry_remains_reachable_via_get_any() {
        let cache = ResponseCache::new(config(10), None);
        cache.insert("GET /users", 200, serde_json::json!({"users": [1]}));

        std::thread::sleep(Duration::from_millis(30));
        let entry = cache.get_any("GET /users").unwrap();
        assert!(!entry.is_fresh());
        assert_eq!(entry.status, 200);
    }

    #[test]
    fn sweep_evicts_expired_entries() {
        let cache = ResponseCache::new(config(10), None);
        cache.insert("GET /a", 200, Value::Null);
        cache.insert("GET /b", 200, Value::Null);

        std::thread::sleep(Duration::from_millis(30));
        cache.insert("GET /c", 200, Value::Null);
        cache.sweep();

        assert_eq!(cache.len(), 1);
        assert!(cache.get_any("GET /c").is_some());
    }

    #[test]
    fn entry_bound_evicts_closest_to_expiry() {
        let mut cfg = config(60_000);
        cfg.max_entries = 2;
        let cache = ResponseCache::new(cfg, None);

        cache.insert("GET /a", 200, Value::Null);
        std::thread::sleep(Duration::from_millis(5));
        cache.insert("GET /b", 200, Value::Null);
        std::thread::sleep(Duration::from_millis(5));
        cache.insert("GET /c", 200, Value::Null);

        assert_eq!(cache.len(), 2);
        assert!(cache.get_any("GET /a").is_none());
    }

    #[test]
    fn persisted_cache_rehydrates_on_restart() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let mut cfg = config(60_000);
        cfg.persist = true;

        let cache = ResponseCache::new(cfg.clone(), Some(Arc::clone(&store)));
        cache.insert("GET /users", 200, serde_json::json!({"warm": true}));
        drop(cache);

        let reborn = ResponseCache::new(cfg, Some(store));
        let entry = reborn.get_fresh("GET /users").unwrap();
        assert_eq!(entry.body["warm"], true);
    }
}
