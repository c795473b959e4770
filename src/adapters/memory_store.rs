//! In-Memory Backing Store
//!
//! A [`BackingStore`] held in a `DashMap`. Serves the standalone binary and
//! the test suites: it can simulate latency and outages, counts loads, and
//! optionally journals every mutation in the order it was applied.

use crate::domain::ports::BackingStore;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

/// One applied mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: String,
    /// `None` for a removal
    pub value: Option<Bytes>,
}

/// Backing store kept in process memory
#[derive(Default)]
pub struct MemoryStore {
    records: DashMap<String, Bytes>,
    access_counts: DashMap<String, u64>,
    latency: Mutex<Duration>,
    unavailable: AtomicBool,
    loads: AtomicU64,
    writes: AtomicU64,
    journal: Option<Mutex<Vec<Mutation>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every applied mutation
    pub fn with_journal() -> Self {
        Self {
            journal: Some(Mutex::new(Vec::new())),
            ..Default::default()
        }
    }

    /// Delay every operation by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Simulate an outage
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::Release);
    }

    /// Insert a record without counting it as a write
    pub fn seed(&self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.records.insert(key.into(), value.into());
    }

    /// Current record, bypassing latency and counters
    pub fn peek(&self, key: &str) -> Option<Bytes> {
        self.records.get(key).map(|v| v.value().clone())
    }

    /// Number of `load` calls served
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Number of `store`/`remove` calls applied
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Applied mutations, oldest first (empty unless journaling)
    pub fn journal(&self) -> Vec<Mutation> {
        self.journal
            .as_ref()
            .map(|j| j.lock().clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    async fn enter(&self, key: &str) -> Result<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::BackingStoreUnavailable {
                key: key.to_string(),
                reason: "store offline".to_string(),
            });
        }
        Ok(())
    }

    fn record(&self, key: &str, value: Option<Bytes>) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if let Some(journal) = &self.journal {
            journal.lock().push(Mutation {
                key: key.to_string(),
                value,
            });
        }
    }
}

#[async_trait]
impl BackingStore for MemoryStore {
    async fn load(&self, key: &str) -> Result<Option<Bytes>> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.enter(key).await?;
        *self.access_counts.entry(key.to_string()).or_insert(0) += 1;
        Ok(self.peek(key))
    }

    async fn store(&self, key: &str, value: Bytes) -> Result<()> {
        self.enter(key).await?;
        self.records.insert(key.to_string(), value.clone());
        self.record(key, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.enter(key).await?;
        self.records.remove(key);
        self.record(key, None);
        Ok(())
    }

    async fn popular_keys(&self, limit: usize) -> Result<Vec<String>> {
        let mut counts: Vec<(String, u64)> = self
            .access_counts
            .iter()
            .filter(|e| self.records.contains_key(e.key()))
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(counts.into_iter().take(limit).map(|(k, _)| k).collect())
    }
}
