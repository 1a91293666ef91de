//! Idempotency Cache (C8) — per-connection request-id → response cache
//! with a time window (§4.8).
//!
//! Stores the serialized response bytes, not a handle to recomputable state,
//! so replays are byte-identical even if backend state changed afterward —
//! the same instinct behind `daemon/src/storage/event_log.rs` caching the
//! already-serialized audit line rather than the structured value. A
//! background sweep (spawned by the orchestrator, C12) complements the
//! lookup-time eviction, matching the periodic-task shape used throughout
//! `daemon/src/main.rs`'s `run_server`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

pub struct IdempotencyCache {
    window: Duration,
    entries: HashMap<String, (Vec<u8>, Instant)>,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl IdempotencyCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: HashMap::new(),
        }
    }

    /// Look up a cached response for `request_id`. Evicts on a stale miss.
    pub fn get(&mut self, request_id: &str) -> Option<Vec<u8>> {
        if let Some((bytes, inserted_at)) = self.entries.get(request_id) {
            if inserted_at.elapsed() <= self.window {
                return Some(bytes.clone());
            }
            self.entries.remove(request_id);
        }
        None
    }

    pub fn insert(&mut self, request_id: String, response_bytes: Vec<u8>) {
        self.entries.insert(request_id, (response_bytes, Instant::now()));
    }

    /// Evict every entry older than the window. Called by the periodic sweep.
    pub fn sweep(&mut self) {
        self.entries.retain(|_, (_, inserted_at)| inserted_at.elapsed() <= self.window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_and_replays_byte_identical() {
        let mut cache = IdempotencyCache::default();
        cache.insert("r-7".to_string(), b"response-bytes".to_vec());
        assert_eq!(cache.get("r-7"), Some(b"response-bytes".to_vec()));
        assert_eq!(cache.get("r-7"), Some(b"response-bytes".to_vec()));
    }

    #[test]
    fn miss_returns_none() {
        let mut cache = IdempotencyCache::default();
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn expired_entry_is_evicted_on_lookup() {
        let mut cache = IdempotencyCache::new(Duration::from_millis(1));
        cache.insert("r-1".to_string(), b"x".to_vec());
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("r-1"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_evicts_without_lookup() {
        let mut cache = IdempotencyCache::new(Duration::from_millis(1));
        cache.insert("r-1".to_string(), b"x".to_vec());
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        assert!(cache.is_empty());
    }
}
