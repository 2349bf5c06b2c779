//! Best-effort key/value state stores
//!
//! Identifiers and caches survive restarts through these stores, but
//! nothing depends on them for correctness: every operation is
//! infallible at the call site and degrades to in-memory state when the
//! filesystem is unavailable (read-only media, missing home directory,
//! sandboxed processes).

use directories::ProjectDirs;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// A string key/value store that never fails from the caller's view.
///
/// Implementations swallow I/O errors and report them at debug level
/// only; callers always get an answer, possibly from a memory overlay.
pub trait StateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Pure in-memory store. The fallback when no filesystem is usable and
/// the default session store in tests.
#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut map) = self.map.lock() {
            map.insert(key.to_string(), value.to_string());
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut map) = self.map.lock() {
            map.remove(key);
        }
    }
}

/// File-backed store holding a single JSON object per file.
///
/// Writes go through the memory overlay first, then are mirrored to
/// disk. Once a disk write fails the store keeps serving the overlay
/// and stops retrying until the next successful write.
pub struct FileStore {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl FileStore {
    /// Open (or create) a store at an explicit path.
    pub fn open(path: PathBuf) -> Self {
        let map = Self::load_map(&path);
        Self {
            path,
            map: Mutex::new(map),
        }
    }

    /// Durable store shared by every run of the application.
    pub fn durable(app: &str) -> Self {
        let path = Self::base_dir(app)
            .map(|dir| dir.join("state.json"))
            .unwrap_or_else(|| PathBuf::from(format!(".{app}-state.json")));
        Self::open(path)
    }

    /// Session-scoped store: keyed by process id, so a restarted
    /// process starts clean while re-reads within the same process (or
    /// a supervisor that preserves the file) rehydrate.
    pub fn session(app: &str) -> Self {
        let file = format!("session-{}.json", std::process::id());
        let path = match Self::base_dir(app) {
            Some(dir) => dir.join(&file),
            None => std::env::temp_dir().join(&file),
        };
        Self::open(path)
    }

    fn base_dir(app: &str) -> Option<PathBuf> {
        ProjectDirs::from("com", app, app).map(|dirs| dirs.data_dir().to_path_buf())
    }

    fn load_map(path: &PathBuf) -> HashMap<String, String> {
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::debug!(path = %path.display(), error = %e, "state file unreadable, starting empty");
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        }
    }

    fn persist(&self, map: &HashMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                tracing::debug!(path = %self.path.display(), "state dir not writable");
                return;
            }
        }
        match serde_json::to_string(map) {
            Ok(content) => {
                if let Err(e) = std::fs::write(&self.path, content) {
                    tracing::debug!(path = %self.path.display(), error = %e, "state write failed");
                }
            }
            Err(e) => tracing::debug!(error = %e, "state serialization failed"),
        }
    }
}

impl StateStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut map) = self.map.lock() {
            map.insert(key.to_string(), value.to_string());
            self.persist(&map);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut map) = self.map.lock() {
            map.remove(key);
            self.persist(&map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert_eq!(store.get("k"), None);

        store.set("k", "v");
        assert_eq!(store.get("k"), Some("v".to_string()));

        store.remove("k");
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn file_store_round_trip_and_rehydrate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStore::open(path.clone());
        store.set("trace", "abc");
        drop(store);

        let reopened = FileStore::open(path);
        assert_eq!(reopened.get("trace"), Some("abc".to_string()));
    }

    #[test]
    fn file_store_degrades_silently_on_unwritable_path() {
        // A directory path cannot be written as a file; operations must
        // still serve the memory overlay without erroring.
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path().to_path_buf());

        store.set("k", "v");
        assert_eq!(store.get("k"), Some("v".to_string()));

        store.remove("k");
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn file_store_ignores_corrupt_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();

        let store = FileStore::open(path);
        assert_eq!(store.get("anything"), None);
    }
}
