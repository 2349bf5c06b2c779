//! Retry bookkeeping and the auth-recovery seam
//!
//! Each request key moves `Fresh -> Retrying(n) -> Recovered |
//! Exhausted`. `Fresh` is the absence of an entry; both terminal
//! states clear the entry, so the ledger only ever holds keys with a
//! retry in progress.

use crate::client::{ApiRequest, ApiResponse};
use crate::error::ApiError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Per-request-key retry state.
#[derive(Debug, Default)]
pub struct RetryLedger {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RetryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more retry for the key and return the new count.
    pub fn record_retry(&self, key: &str) -> u32 {
        let mut attempts = self.lock();
        let count = attempts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// `None` means the key is Fresh.
    pub fn retrying(&self, key: &str) -> Option<u32> {
        self.lock().get(key).copied()
    }

    /// Terminal state: the key recovered; bookkeeping is cleared.
    pub fn recovered(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Terminal state: the key exhausted its budget; bookkeeping is
    /// cleared and the caller surfaces the original error.
    pub fn exhausted(&self, key: &str) {
        self.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        match self.attempts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Outcome of delegating a 401 to the auth collaborator.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Credentials refreshed; dispatch this request again.
    Retry(ApiRequest),
    /// The collaborator resolved a response itself.
    Fallback(ApiResponse),
    /// Nothing to be done; the client resolves a synthetic auth-failed
    /// response so callers can branch without an unhandled rejection.
    Unrecoverable,
}

/// External auth-recovery collaborator. Auth business rules live
/// outside this crate; only the hook-in point is defined here.
#[async_trait]
pub trait AuthRecovery: Send + Sync {
    async fn recover(&self, error: &ApiError, request: &ApiRequest) -> AuthOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_keys_have_no_entry() {
        let ledger = RetryLedger::new();
        assert_eq!(ledger.retrying("GET /users"), None);
    }

    #[test]
    fn retries_count_up_per_key() {
        let ledger = RetryLedger::new();
        assert_eq!(ledger.record_retry("GET /users"), 1);
        assert_eq!(ledger.record_retry("GET /users"), 2);
        assert_eq!(ledger.record_retry("GET /orders"), 1);
        assert_eq!(ledger.retrying("GET /users"), Some(2));
    }

    #[test]
    fn terminal_states_clear_bookkeeping() {
        let ledger = RetryLedger::new();
        ledger.record_retry("GET /users");
        ledger.recovered("GET /users");
        assert_eq!(ledger.retrying("GET /users"), None);

        ledger.record_retry("GET /orders");
        ledger.exhausted("GET /orders");
        assert!(ledger.is_empty());
    }
}
