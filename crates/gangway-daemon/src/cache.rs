//! Count-bounded cache with per-entry expiry
//!
//! Backs the transfer tables: entries age out a fixed interval after
//! insertion (progress never refreshes the clock), and a full cache refuses
//! new entries instead of rotating out the oldest - transfer slots are a
//! hard limit the caller must surface, not a working set.
//!
//! An optional eviction hook reclaims whatever the entry holds (open file
//! handles, partial files). It fires on every removal path - explicit
//! removal, expiry, sweep - but not on [`ExpiringCache::take`], which is
//! consumption rather than cleanup. Hooks run after the internal lock is
//! released so they may do I/O.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;

/// Why an insertion was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InsertError {
    #[error("cache is full")]
    Full,
    #[error("entry already present")]
    Occupied,
}

/// Hook invoked with each evicted entry
pub type EvictHook<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

/// Cache entry with TTL
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() > self.expires_at
    }
}

/// Count-bounded cache with per-entry expiry and an eviction hook
pub struct ExpiringCache<K: Hash + Eq + Clone, V: Clone> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    ttl: Duration,
    capacity: usize,
    on_evict: Option<EvictHook<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> ExpiringCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self::build(capacity, ttl, None)
    }

    pub fn with_evict_hook(capacity: usize, ttl: Duration, hook: EvictHook<K, V>) -> Self {
        Self::build(capacity, ttl, Some(hook))
    }

    fn build(capacity: usize, ttl: Duration, on_evict: Option<EvictHook<K, V>>) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            ttl,
            capacity,
            on_evict,
        }
    }

    /// Insert a fresh entry. Fails with [`InsertError::Full`] at capacity
    /// and [`InsertError::Occupied`] when a live entry already holds the key;
    /// neither failure evicts anything that is still live.
    pub fn insert(&self, key: K, value: V) -> Result<(), InsertError> {
        let (expired, result) = {
            let mut entries = self.entries.lock();
            let expired = Self::drain_expired(&mut entries);
            let result = if entries.contains(&key) {
                Err(InsertError::Occupied)
            } else if entries.len() >= self.capacity {
                Err(InsertError::Full)
            } else {
                entries.put(key, CacheEntry::new(value, self.ttl));
                Ok(())
            };
            (expired, result)
        };
        self.fire(&expired);
        result
    }

    /// Fetch a live entry, promoting it in LRU order. An expired entry is
    /// evicted on the spot and reported as absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let (evicted, found) = {
            let mut entries = self.entries.lock();
            match entries.get(key) {
                Some(entry) if !entry.is_expired() => (None, Some(entry.value.clone())),
                Some(_) => (entries.pop(key).map(|e| e.value), None),
                None => (None, None),
            }
        };
        if let Some(value) = &evicted {
            self.fire_one(key, value);
        }
        found
    }

    /// Remove and return a live entry without firing the eviction hook.
    /// An expired entry is evicted (hook fires) and reported as absent.
    pub fn take(&self, key: &K) -> Option<V> {
        let (evicted, taken) = {
            let mut entries = self.entries.lock();
            match entries.pop(key) {
                Some(entry) if !entry.is_expired() => (None, Some(entry.value)),
                Some(entry) => (Some(entry.value), None),
                None => (None, None),
            }
        };
        if let Some(value) = &evicted {
            self.fire_one(key, value);
        }
        taken
    }

    /// Remove an entry, firing the eviction hook. Returns whether an entry
    /// was present at all (live or expired).
    pub fn remove(&self, key: &K) -> bool {
        let removed = {
            let mut entries = self.entries.lock();
            entries.pop(key).map(|e| e.value)
        };
        match removed {
            Some(value) => {
                self.fire_one(key, &value);
                true
            }
            None => false,
        }
    }

    /// Remove every entry matching `pred`, firing the eviction hook for each.
    pub fn remove_where<F: Fn(&K, &V) -> bool>(&self, pred: F) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            let keys: Vec<K> = entries
                .iter()
                .filter(|(k, e)| pred(k, &e.value))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.pop(&k).map(|e| (k, e.value)))
                .collect::<Vec<_>>()
        };
        self.fire(&removed);
        removed.len()
    }

    /// Evict every expired entry, firing the hook for each. Returns how many
    /// were evicted.
    pub fn purge_expired(&self) -> usize {
        let expired = {
            let mut entries = self.entries.lock();
            Self::drain_expired(&mut entries)
        };
        self.fire(&expired);
        expired.len()
    }

    /// Whether a live entry holds `key` (no LRU promotion).
    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .lock()
            .peek(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    /// Whether any live entry matches `pred`.
    pub fn any<F: Fn(&K, &V) -> bool>(&self, pred: F) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|(k, e)| !e.is_expired() && pred(k, &e.value))
    }

    /// Number of entries, including any not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn drain_expired(entries: &mut LruCache<K, CacheEntry<V>>) -> Vec<(K, V)> {
        let keys: Vec<K> = entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| entries.pop(&k).map(|e| (k, e.value)))
            .collect()
    }

    fn fire(&self, removed: &[(K, V)]) {
        for (k, v) in removed {
            self.fire_one(k, v);
        }
    }

    fn fire_one(&self, key: &K, value: &V) {
        if let Some(hook) = &self.on_evict {
            hook(key, value);
        }
    }
}
