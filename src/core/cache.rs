//! Bounded in-process cache of resolved keys.
//!
//! Eviction is insertion-order (FIFO): the entry that was inserted first
//! goes first, regardless of how often it is read. Entries also expire
//! after a TTL; an expired entry is dropped on the `get` that finds it.
//!
//! Time comes from `tokio::time::Instant`, so paused-clock tests can move
//! past the TTL without sleeping.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{ContentKey, Format, Resolution};

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries (0 disables the cache)
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Entry lifetime in seconds
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

fn default_capacity() -> usize {
    2000
}
fn default_ttl_seconds() -> u64 {
    3 * 24 * 60 * 60
} // 3 days

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

/// Cached view of a resolved key
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub title: String,
    pub url: String,
    pub duration_seconds: u64,
    pub format: Format,
    pub inserted_at: Instant,
}

impl CacheEntry {
    pub fn new(title: impl Into<String>, url: impl Into<String>, duration_seconds: u64, format: Format) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            duration_seconds,
            format,
            inserted_at: Instant::now(),
        }
    }

    pub fn from_resolution(resolution: &Resolution) -> Self {
        Self::new(
            resolution.title.clone(),
            resolution.url.clone(),
            resolution.duration_seconds,
            resolution.key.format(),
        )
    }

    pub fn age(&self) -> Duration {
        self.inserted_at.elapsed()
    }
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

struct Slot {
    entry: CacheEntry,
    seq: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ContentKey, Slot>,
    // (seq, key) in insertion order; stale pairs are skipped lazily
    order: VecDeque<(u64, ContentKey)>,
    next_seq: u64,
    stats: CacheStats,
}

impl Inner {
    fn evict_oldest(&mut self) -> Option<ContentKey> {
        while let Some((seq, key)) = self.order.pop_front() {
            let live = self.entries.get(&key).map(|s| s.seq == seq).unwrap_or(false);
            if live {
                self.entries.remove(&key);
                self.stats.evictions += 1;
                return Some(key);
            }
        }
        None
    }

    fn compact(&mut self) {
        let entries = &self.entries;
        self.order
            .retain(|(seq, key)| entries.get(key).map(|s| s.seq == *seq).unwrap_or(false));
    }
}

/// FIFO + TTL memory cache
pub struct MemoryCache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
}

impl MemoryCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_limits(config.capacity, config.ttl())
    }

    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            ttl,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Look up a key, dropping it if its TTL has passed
    pub fn get(&self, key: &ContentKey) -> Option<CacheEntry> {
        let mut inner = self.inner.lock();

        let found = inner
            .entries
            .get(key)
            .map(|slot| (slot.entry.age() < self.ttl, slot.entry.clone()));

        match found {
            Some((true, entry)) => {
                inner.stats.hits += 1;
                return Some(entry);
            }
            Some((false, _)) => {
                inner.entries.remove(key);
                inner.stats.expirations += 1;
                debug!(key = %key, "Cache entry expired");
            }
            None => {}
        }
        inner.stats.misses += 1;
        None
    }

    /// Insert or replace an entry; replacing moves it to the back of the queue
    pub fn set(&self, key: ContentKey, entry: CacheEntry) {
        if self.capacity == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;

        let replaced = inner
            .entries
            .insert(key.clone(), Slot { entry, seq })
            .is_some();
        inner.order.push_back((seq, key));

        if !replaced {
            while inner.entries.len() > self.capacity {
                match inner.evict_oldest() {
                    Some(evicted) => debug!(key = %evicted, "Evicted oldest cache entry"),
                    None => break,
                }
            }
        }

        if inner.order.len() > self.capacity.saturating_mul(2).max(16) {
            inner.compact();
        }
    }

    pub fn remove(&self, key: &ContentKey) -> Option<CacheEntry> {
        self.inner.lock().entries.remove(key).map(|s| s.entry)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: &str) -> ContentKey {
        ContentKey::new(id, Format::Audio)
    }

    fn entry(title: &str) -> CacheEntry {
        CacheEntry::new(title, format!("https://cdn/{}", title), 60, Format::Audio)
    }

    #[tokio::test]
    async fn test_fifo_eviction() {
        let cache = MemoryCache::with_limits(2, Duration::from_secs(60));

        cache.set(key("a"), entry("a"));
        cache.set(key("b"), entry("b"));
        // Reading "a" does not protect it: eviction is by insertion order
        assert!(cache.get(&key("a")).is_some());
        cache.set(key("c"), entry("c"));

        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());
        assert!(cache.get(&key("c")).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_reset_moves_key_to_back() {
        let cache = MemoryCache::with_limits(2, Duration::from_secs(60));

        cache.set(key("a"), entry("a"));
        cache.set(key("b"), entry("b"));
        cache.set(key("a"), entry("a2"));
        cache.set(key("c"), entry("c"));

        assert!(cache.get(&key("b")).is_none());
        assert_eq!(cache.get(&key("a")).unwrap().title, "a2");
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::with_limits(10, Duration::from_secs(30));
        cache.set(key("a"), entry("a"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get(&key("a")).is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_disables_cache() {
        let cache = MemoryCache::with_limits(0, Duration::from_secs(60));
        cache.set(key("a"), entry("a"));
        assert!(cache.get(&key("a")).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_order_queue_is_compacted() {
        let cache = MemoryCache::with_limits(2, Duration::from_secs(60));
        for i in 0..100 {
            cache.set(key("a"), entry(&format!("a{}", i)));
        }
        assert_eq!(cache.len(), 1);
        assert!(cache.inner.lock().order.len() <= 16);
    }
}
