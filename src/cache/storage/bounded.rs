//! Bounded In-Memory Store
//!
//! A `DashMap` of entries plus a separately locked [`LruIndex`]. Reads go
//! through the sharded map without taking the recency lock; the recency touch
//! that follows a hit uses `try_lock` and is skipped when another thread holds
//! the lock, so under contention recency is approximate rather than a
//! bottleneck. Every mutation (insert, delete, eviction, expiry) takes the
//! recency lock first, which keeps the map and the index in step.
//!
//! Lock order: recency mutex, then map shard. Never the reverse.

use crate::cache::entry::CacheEntry;
use crate::cache::lru::LruIndex;
use crate::cache::storage::SetOutcome;
use crate::cache::tier::TierConfig;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Result of a raw store read
#[derive(Debug, Clone)]
pub enum StoreRead {
    Hit(CacheEntry),
    Miss,
    /// Entry was present but past its TTL; it has been removed
    Expired,
}

/// Capacity-bounded key/value store with LRU eviction and lazy expiry
pub struct BoundedStore {
    config: TierConfig,
    entries: DashMap<String, CacheEntry>,
    recency: Mutex<LruIndex>,
    bytes: AtomicU64,
    next_version: AtomicU64,
}

impl BoundedStore {
    pub fn new(config: TierConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            recency: Mutex::new(LruIndex::new()),
            bytes: AtomicU64::new(0),
            next_version: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &TierConfig {
        &self.config
    }

    /// Read an entry, expiring it lazily and recording the access
    pub fn get(&self, key: &str) -> StoreRead {
        let entry = match self.entries.get(key) {
            Some(e) => e.value().clone(),
            None => return StoreRead::Miss,
        };

        if entry.is_expired() {
            self.remove_version(key, entry.version);
            return StoreRead::Expired;
        }

        if let Some(mut lru) = self.recency.try_lock() {
            lru.touch(key);
        }
        StoreRead::Hit(entry)
    }

    /// Read a live entry without touching recency
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.entries
            .get(key)
            .filter(|e| !e.is_expired())
            .map(|e| e.value().clone())
    }

    /// Insert or replace an entry, evicting least recently used keys as needed
    ///
    /// An entry larger than the byte capacity is rejected, and any previous
    /// value under the same key is dropped so it cannot be served stale.
    pub fn insert(&self, mut entry: CacheEntry) -> SetOutcome {
        let size = entry.stored_size();
        let mut lru = self.recency.lock();

        if !self.config.admits(size) {
            if self.entries.remove(&entry.key).is_some() {
                lru.remove(&entry.key);
            }
            self.bytes.store(lru.total_weight(), Ordering::Relaxed);
            return SetOutcome::Rejected {
                size_bytes: size,
                capacity_bytes: self.config.capacity_bytes,
            };
        }

        let version = self.next_version.fetch_add(1, Ordering::Relaxed) + 1;
        entry.version = version;
        let key = entry.key.clone();
        self.entries.insert(key.clone(), entry);
        lru.insert(&key, size);

        let evicted = lru
            .evict_until(self.config.max_entries, self.config.capacity_bytes)
            .into_iter()
            .map(|(victim, _)| {
                self.entries.remove(&victim);
                victim
            })
            .collect();

        self.bytes.store(lru.total_weight(), Ordering::Relaxed);
        SetOutcome::Stored { version, evicted }
    }

    /// Remove a key
    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        let mut lru = self.recency.lock();
        let (_, entry) = self.entries.remove(key)?;
        lru.remove(key);
        self.bytes.store(lru.total_weight(), Ordering::Relaxed);
        Some(entry)
    }

    /// Restart the TTL of a live key
    pub fn touch(&self, key: &str) -> bool {
        self.renew(key, None)
    }

    /// Give a live key a new TTL starting now
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        self.renew(key, Some(ttl))
    }

    /// Remove every live or expired key matching the predicate
    pub fn remove_matching(&self, matches: impl Fn(&str) -> bool) -> Vec<String> {
        let mut lru = self.recency.lock();
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| matches(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            self.entries.remove(key);
            lru.remove(key);
        }
        self.bytes.store(lru.total_weight(), Ordering::Relaxed);
        keys
    }

    /// Remove all expired entries
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Utc::now();
        let mut lru = self.recency.lock();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_expired_at(now))
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
            lru.remove(key);
        }
        self.bytes.store(lru.total_weight(), Ordering::Relaxed);
        expired
    }

    /// Live keys
    pub fn keys(&self) -> Vec<String> {
        let now = Utc::now();
        self.entries
            .iter()
            .filter(|e| !e.is_expired_at(now))
            .map(|e| e.key().clone())
            .collect()
    }

    /// Keys from least to most recently used
    pub fn recency_order(&self) -> Vec<String> {
        self.recency.lock().iter().map(str::to_string).collect()
    }

    /// Number of stored entries (including expired ones not yet swept)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stored bytes
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Remove everything, returning the number of entries dropped
    pub fn clear(&self) -> usize {
        let mut lru = self.recency.lock();
        let removed = self.entries.len();
        self.entries.clear();
        lru.clear();
        self.bytes.store(0, Ordering::Relaxed);
        removed
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn renew(&self, key: &str, ttl: Option<Duration>) -> bool {
        let mut lru = self.recency.lock();
        let expired = match self.entries.get_mut(key) {
            Some(mut entry) => {
                if entry.is_expired() {
                    true
                } else {
                    let renewed = entry.renewed(ttl.unwrap_or(entry.ttl));
                    *entry = renewed;
                    false
                }
            }
            None => return false,
        };

        if expired {
            self.entries.remove(key);
            lru.remove(key);
            self.bytes.store(lru.total_weight(), Ordering::Relaxed);
            return false;
        }
        lru.touch(key);
        true
    }

    /// Remove a key only if it still holds the given version
    fn remove_version(&self, key: &str, version: u64) {
        let mut lru = self.recency.lock();
        if self
            .entries
            .remove_if(key, |_, e| e.version == version)
            .is_some()
        {
            lru.remove(key);
            self.bytes.store(lru.total_weight(), Ordering::Relaxed);
        }
    }
}
