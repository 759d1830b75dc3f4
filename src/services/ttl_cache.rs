//! Bounded LRU container with per-entry TTL, shared by the revocation and
//! blacklist caches. Evictions are counted so the owner can report them on
//! a fixed cadence.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

pub struct TtlLruCache<V> {
    inner: Mutex<LruCache<String, Entry<V>>>,
    ttl: Duration,
    evictions: Mutex<u64>,
}

impl<V: Copy> TtlLruCache<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        TtlLruCache {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
            evictions: Mutex::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match cache.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value),
            Some(_) => {
                cache.pop(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: &str, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        let mut cache = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((evicted_key, _)) = cache.push(key.to_string(), entry) {
            if evicted_key != key {
                drop(cache);
                let mut evictions = self.evictions.lock().unwrap_or_else(|e| e.into_inner());
                *evictions += 1;
            }
        }
    }

    /// Read and reset the eviction counter.
    pub fn take_eviction_count(&self) -> u64 {
        let mut evictions = self.evictions.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *evictions)
    }
}
