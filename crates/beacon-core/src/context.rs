//! Session correlation context
//!
//! One `ContextManager` owns the trace id, the per-call request id
//! sequence, and the user identity. Everything else in the pipeline
//! reads identifiers from here and never mutates them directly.

use crate::storage::StateStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

const TRACE_KEY: &str = "trace_id";
const USER_KEY: &str = "user_id";

/// Owns trace/request/user identifiers for one client session.
///
/// The trace id is persisted in the session-scoped store so it survives
/// an in-process reload; the user id lives in the durable store until
/// explicitly cleared. Storage failures never surface: the manager
/// falls back to whatever it already holds in memory.
pub struct ContextManager {
    session: Arc<dyn StateStore>,
    durable: Arc<dyn StateStore>,
    trace_id: Mutex<Option<String>>,
    sequence: AtomicU64,
    current_request: Mutex<Option<String>>,
}

impl ContextManager {
    pub fn new(session: Arc<dyn StateStore>, durable: Arc<dyn StateStore>) -> Self {
        Self {
            session,
            durable,
            trace_id: Mutex::new(None),
            sequence: AtomicU64::new(0),
            current_request: Mutex::new(None),
        }
    }

    /// Current session trace id.
    ///
    /// Loaded lazily from the session store; anything absent or not
    /// matching the 32-hex-digit format is replaced with a fresh id.
    pub fn trace_id(&self) -> String {
        let mut guard = match self.trace_id.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(id) = guard.as_ref() {
            return id.clone();
        }

        let id = match self.session.get(TRACE_KEY) {
            Some(stored) if is_valid_trace_id(&stored) => stored,
            _ => {
                let fresh = mint_trace_id();
                self.session.set(TRACE_KEY, &fresh);
                fresh
            }
        };

        *guard = Some(id.clone());
        id
    }

    /// Mint a new trace id and reset the request sequence.
    ///
    /// Used on session boundaries (logout/login); previously issued
    /// request ids keep their old prefix.
    pub fn reset_trace_id(&self) -> String {
        let fresh = mint_trace_id();
        self.session.set(TRACE_KEY, &fresh);

        let mut guard = match self.trace_id.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(fresh.clone());
        self.sequence.store(0, Ordering::SeqCst);

        if let Ok(mut current) = self.current_request.lock() {
            *current = None;
        }
        fresh
    }

    /// Next request id: `{trace}-{seq:03}`, strictly increasing within
    /// one trace.
    pub fn next_request_id(&self) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{:03}", self.trace_id(), seq);
        if let Ok(mut current) = self.current_request.lock() {
            *current = Some(id.clone());
        }
        id
    }

    /// The most recently issued request id, if any.
    pub fn current_request_id(&self) -> Option<String> {
        self.current_request.lock().ok()?.clone()
    }

    pub fn set_user_id(&self, user_id: &str) {
        self.durable.set(USER_KEY, user_id);
    }

    pub fn user_id(&self) -> Option<String> {
        self.durable.get(USER_KEY)
    }

    pub fn clear_user_id(&self) {
        self.durable.remove(USER_KEY);
    }
}

fn mint_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn is_valid_trace_id(candidate: &str) -> bool {
    candidate.len() == 32 && candidate.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn manager() -> ContextManager {
        ContextManager::new(Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    #[test]
    fn trace_id_is_stable_within_a_session() {
        let ctx = manager();
        let first = ctx.trace_id();
        let second = ctx.trace_id();

        assert_eq!(first, second);
        assert!(is_valid_trace_id(&first));
    }

    #[test]
    fn trace_id_survives_a_reload_through_the_session_store() {
        let session: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let durable: Arc<dyn StateStore> = Arc::new(MemoryStore::new());

        let first = ContextManager::new(Arc::clone(&session), Arc::clone(&durable)).trace_id();
        let second = ContextManager::new(session, durable).trace_id();

        assert_eq!(first, second);
    }

    #[test]
    fn invalid_stored_trace_id_is_replaced() {
        let session: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        session.set("trace_id", "not-a-trace-id");

        let ctx = ContextManager::new(Arc::clone(&session), Arc::new(MemoryStore::new()));
        let id = ctx.trace_id();

        assert!(is_valid_trace_id(&id));
        assert_eq!(session.get("trace_id"), Some(id));
    }

    #[test]
    fn request_ids_are_monotonic_and_share_the_trace_prefix() {
        let ctx = manager();
        let trace = ctx.trace_id();

        let mut previous = 0u64;
        for _ in 0..10 {
            let id = ctx.next_request_id();
            let (prefix, seq) = id.rsplit_once('-').unwrap();
            assert_eq!(prefix, trace);

            let seq: u64 = seq.parse().unwrap();
            assert!(seq > previous);
            previous = seq;
        }

        assert_eq!(ctx.current_request_id(), Some(format!("{trace}-010")));
    }

    #[test]
    fn reset_starts_a_new_trace_and_sequence() {
        let ctx = manager();
        let before = ctx.trace_id();
        ctx.next_request_id();
        ctx.next_request_id();

        let after = ctx.reset_trace_id();
        assert_ne!(before, after);
        assert_eq!(ctx.current_request_id(), None);
        assert_eq!(ctx.next_request_id(), format!("{after}-001"));
    }

    #[test]
    fn user_id_round_trip_and_clear() {
        let ctx = manager();
        assert_eq!(ctx.user_id(), None);

        ctx.set_user_id("user-42");
        assert_eq!(ctx.user_id(), Some("user-42".to_string()));

        ctx.clear_user_id();
        assert_eq!(ctx.user_id(), None);
    }

    #[test]
    fn user_id_survives_trace_reset() {
        let ctx = manager();
        ctx.set_user_id("user-42");
        ctx.reset_trace_id();
        assert_eq!(ctx.user_id(), Some("user-42".to_string()));
    }
}
