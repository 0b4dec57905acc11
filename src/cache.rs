//! Bounded, expiring caches used by the network layer
//!
//! - [`SeenCache`]: message ids gossip has already handled, so a message
//!   circulating through the mesh is processed and forwarded at most once.
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Set of recently seen message ids. Entries expire after `ttl`; once
/// `capacity` is reached the least recently inserted id is evicted.
///
/// Uses the tokio clock so tests can drive expiry with a paused runtime.
#[derive(Clone)]
pub struct SeenCache {
    entries: Arc<Mutex<LruCache<String, Instant>>>,
    ttl: Duration,
}

impl SeenCache {
    pub const DEFAULT_CAPACITY: usize = 10_000;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(capacity: usize, ttl: Duration) -> Self {
        // A zero capacity is mapped to 1
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Arc::new(Mutex::new(LruCache::new(capacity))),
            ttl,
        }
    }

    /// Records `id`. Returns true if it was not already present (or its
    /// previous sighting had expired), i.e. the caller should process it.
    pub fn insert(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if let Some(seen_at) = entries.peek(id) {
            if now.duration_since(*seen_at) < self.ttl {
                return false;
            }
        }
        entries.put(id.to_string(), now);
        true
    }

    /// Non-mutating lookup; does not refresh the entry.
    pub fn contains(&self, id: &str) -> bool {
        let entries = self.entries.lock();
        entries
            .peek(id)
            .is_some_and(|seen_at| seen_at.elapsed() < self.ttl)
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, seen_at)| seen_at.elapsed() >= self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.pop(id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY, Self::DEFAULT_TTL)
    }
}
