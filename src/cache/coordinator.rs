//! Write-Path Coordinator
//!
//! Entry point for callers. Reads walk local tier -> distributed tier ->
//! backing store, populating the tiers on the way back; concurrent misses on
//! one key share a single backing-store load. Writes follow the pattern of
//! the key's data class:
//!
//! | Pattern         | Write                                   | Read extra                    |
//! |-----------------|-----------------------------------------|-------------------------------|
//! | `CacheAside`    | store, then drop the cached entry       |                               |
//! | `WriteThrough`  | store, then cache the new value         |                               |
//! | `WriteBehind`   | cache, then queue the store write       |                               |
//! | `RefreshAhead`  | as `WriteThrough`                       | background reload near expiry |
//!
//! Keys are resolved against their namespace's current generation before
//! touching any tier, so a generation bump orphans every earlier entry.
//!
//! Reads stay correct while background work is outstanding: a distributed
//! copy older than a pending invalidation is skipped, and a key with a queued
//! write-behind operation is answered from that operation instead of the
//! backing store.

use crate::cache::codec::Codec;
use crate::cache::entry::CacheKey;
use crate::cache::events::{CacheEvent, EventBus};
use crate::cache::invalidation::{InvalidationEngine, InvalidationReport, KeyPattern, SweepReport};
use crate::cache::metrics::{CacheMetrics, StatsSnapshot};
use crate::cache::retry::with_retry;
use crate::cache::shard::ShardRouter;
use crate::cache::singleflight::{LoadFailure, Singleflight};
use crate::cache::storage::{DistributedTier, LocalTier, Lookup, TierStorage};
use crate::cache::tier::TierKind;
use crate::cache::warmer::AccessTracker;
use crate::cache::write_behind::{PendingWrite, WriteBehindOperation, WriteBehindQueue, WriteOp};
use crate::cache::{ReadResult, RiskCache};
use crate::config::EngineConfig;
use crate::domain::ports::{SharedBackingStore, SharedCacheNode};
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

// =============================================================================
// Data Classes
// =============================================================================

/// Consistency pattern of a data class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePattern {
    #[default]
    CacheAside,
    WriteThrough,
    WriteBehind,
    RefreshAhead,
}

/// Per-namespace caching policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataClassConfig {
    pub pattern: WritePattern,
    /// Entry lifetime; zero keeps entries until evicted
    pub ttl_ms: u64,
    /// Remaining lifetime below which a refresh-ahead read reloads
    pub refresh_window_ms: u64,
}

impl Default for DataClassConfig {
    fn default() -> Self {
        Self {
            pattern: WritePattern::CacheAside,
            ttl_ms: 300_000,
            refresh_window_ms: 30_000,
        }
    }
}

impl DataClassConfig {
    pub fn new(pattern: WritePattern, ttl: Duration) -> Self {
        Self {
            pattern,
            ttl_ms: ttl.as_millis() as u64,
            ..Default::default()
        }
    }

    pub fn with_refresh_window(mut self, window: Duration) -> Self {
        self.refresh_window_ms = window.as_millis() as u64;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn refresh_window(&self) -> Duration {
        Duration::from_millis(self.refresh_window_ms)
    }
}

// =============================================================================
// Coordinator
// =============================================================================

type LoadResult = std::result::Result<Option<Bytes>, LoadFailure>;

/// The cache engine: tiers, invalidation, write-behind and the read path
pub struct Coordinator {
    me: Weak<Coordinator>,
    config: EngineConfig,
    local: Arc<LocalTier>,
    distributed: Arc<DistributedTier>,
    invalidation: Arc<InvalidationEngine>,
    write_behind: WriteBehindQueue,
    store: SharedBackingStore,
    codec: Codec,
    flights: Singleflight<LoadResult>,
    refreshing: DashSet<String>,
    tracker: Arc<AccessTracker>,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
}

impl Coordinator {
    /// Build the engine over a backing store and the distributed nodes
    ///
    /// Spawns the write-behind workers, so it must run inside a tokio runtime.
    pub fn new(
        config: EngineConfig,
        store: SharedBackingStore,
        nodes: Vec<SharedCacheNode>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let metrics = Arc::new(CacheMetrics::new());
        let events = EventBus::new(config.event_channel_capacity);
        let codec = Codec::new(config.codec.clone());

        let local = Arc::new(LocalTier::with_observers(
            config.local.clone(),
            codec.clone(),
            Arc::clone(&metrics),
            events.clone(),
        ));
        let node_count = nodes.len();
        let router = Arc::new(ShardRouter::with_nodes(
            config.distributed.replicas,
            nodes,
            events.clone(),
        ));
        let distributed = Arc::new(DistributedTier::new(
            router,
            codec.clone(),
            Arc::clone(&metrics),
            events.clone(),
        ));
        let invalidation = Arc::new(InvalidationEngine::new(
            Arc::clone(&local),
            Arc::clone(&distributed),
            config.invalidation.clone(),
            Arc::clone(&metrics),
            events.clone(),
        ));
        let write_behind = WriteBehindQueue::start(
            config.write_behind.clone(),
            Arc::clone(&store),
            config.retry.clone(),
            Arc::clone(&metrics),
            events.clone(),
        );
        let tracker = Arc::new(AccessTracker::new(config.warmer.max_tracked_keys));

        info!(
            nodes = node_count,
            replicas = config.distributed.replicas,
            data_classes = config.data_classes.len(),
            "Cache engine initialized"
        );

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            local,
            distributed,
            invalidation,
            write_behind,
            store,
            codec,
            flights: Singleflight::new(),
            refreshing: DashSet::new(),
            tracker,
            metrics,
            events,
        }))
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn local(&self) -> &Arc<LocalTier> {
        &self.local
    }

    pub fn distributed(&self) -> &Arc<DistributedTier> {
        &self.distributed
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        self.distributed.router()
    }

    pub fn invalidation(&self) -> &Arc<InvalidationEngine> {
        &self.invalidation
    }

    pub fn write_behind(&self) -> &WriteBehindQueue {
        &self.write_behind
    }

    pub fn backing_store(&self) -> &SharedBackingStore {
        &self.store
    }

    pub fn access_tracker(&self) -> &AccessTracker {
        &self.tracker
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Subscribe to cache events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Storage key of `key` under its namespace's current generation
    pub fn storage_key(&self, key: &CacheKey) -> String {
        self.invalidation.generations().resolve(key).to_storage_key()
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// Cached value without falling through to the backing store
    pub async fn cached(&self, key: &CacheKey) -> Result<Option<(Bytes, TierKind)>> {
        let skey = self.storage_key(key);
        if let Lookup::Hit(hit) = self.local.get(&skey).await? {
            return Ok(Some((hit.value, TierKind::Local)));
        }
        match self.distributed.get(&skey).await {
            Ok(Lookup::Hit(hit)) if self.invalidation.superseded(&skey, hit.stored_at) => Ok(None),
            Ok(Lookup::Hit(hit)) => Ok(Some((hit.value, TierKind::Distributed))),
            Ok(Lookup::Miss) => Ok(None),
            Err(e) => {
                self.degraded("peek", &skey, &e);
                Ok(None)
            }
        }
    }

    /// Load one logical key into the tiers unless already cached locally
    ///
    /// Returns the bytes loaded, or `None` when nothing was loaded.
    pub async fn warm_key(&self, logical: &str) -> Result<Option<u64>> {
        let key = CacheKey::parse(logical).ok_or_else(|| Error::InvalidKey {
            key: logical.to_string(),
        })?;
        let skey = self.storage_key(&key);
        if self.local.store().peek(&skey).is_some() {
            return Ok(None);
        }
        let class = self.config.class_for(&key.namespace);
        match self.load_through(&key, &skey, class).await? {
            ReadResult::Loaded { value } | ReadResult::Cached { value, .. } => {
                Ok(Some(value.len() as u64))
            }
            ReadResult::NotFound => Ok(None),
        }
    }

    /// Remove expired entries from both tiers
    pub async fn sweep_expired(&self) -> SweepReport {
        self.invalidation.sweep_expired().await
    }

    /// Wait until every queued write-behind operation has been applied
    pub async fn flush(&self) -> Result<()> {
        self.write_behind.flush().await
    }

    /// Drain write-behind and pending invalidations
    pub async fn shutdown(&self, drain_timeout: Duration) {
        info!("Shutting down cache engine");
        self.write_behind.shutdown().await;
        if !self.invalidation.drain(drain_timeout).await {
            warn!(
                pending = self.invalidation.pending(),
                "Invalidation propagation still running at shutdown"
            );
        }
        info!("Cache engine stopped");
    }

    // -------------------------------------------------------------------------
    // Read path
    // -------------------------------------------------------------------------

    fn on_hit(
        &self,
        key: &CacheKey,
        skey: &str,
        tier: TierKind,
        class: &DataClassConfig,
        remaining: Option<Duration>,
    ) {
        self.events.publish(CacheEvent::Hit {
            key: skey.to_string(),
            tier,
        });
        self.maybe_refresh(key, skey, class, remaining);
    }

    async fn load_through(
        &self,
        key: &CacheKey,
        skey: &str,
        class: &DataClassConfig,
    ) -> Result<ReadResult> {
        let logical = key.logical_key();
        let ttl = class.ttl();
        let (result, led) = self
            .flights
            .run(skey, || self.load_and_populate(&logical, skey, ttl))
            .await;
        if !led {
            self.metrics
                .coordinator
                .collapsed_loads
                .fetch_add(1, Ordering::Relaxed);
            debug!(key = %skey, "Joined in-flight load");
        }
        match result {
            Ok(Some(value)) => Ok(ReadResult::Loaded { value }),
            Ok(None) => Ok(ReadResult::NotFound),
            Err(failure) => Err(failure.into()),
        }
    }

    async fn load_and_populate(&self, logical: &str, skey: &str, ttl: Duration) -> LoadResult {
        // A flight that finished just before this one registered has populated the tier
        if let Some(entry) = self.local.store().peek(skey) {
            if let Ok(value) = self.codec.decode(&entry.value) {
                return Ok(Some(value));
            }
        }
        match self.write_behind.pending(logical) {
            Some(PendingWrite::Delete) => return Ok(None),
            Some(PendingWrite::Upsert(value)) => {
                self.populate(skey, value.clone(), ttl).await;
                return Ok(Some(value));
            }
            None => {}
        }
        let value = self.load_from_store(logical).await?;
        if let Some(value) = &value {
            self.populate(skey, value.clone(), ttl).await;
        }
        Ok(value)
    }

    fn maybe_refresh(
        &self,
        key: &CacheKey,
        skey: &str,
        class: &DataClassConfig,
        remaining: Option<Duration>,
    ) {
        if class.pattern != WritePattern::RefreshAhead {
            return;
        }
        let Some(remaining) = remaining else {
            return;
        };
        if remaining >= class.refresh_window() {
            return;
        }
        let Some(this) = self.me.upgrade() else {
            return;
        };
        if !self.refreshing.insert(skey.to_string()) {
            return;
        }

        self.metrics.coordinator.refreshes.fetch_add(1, Ordering::Relaxed);
        self.events.publish(CacheEvent::RefreshScheduled {
            key: skey.to_string(),
        });
        debug!(key = %skey, remaining_ms = remaining.as_millis() as u64, "Refreshing ahead of expiry");

        let logical = key.logical_key();
        let skey = skey.to_string();
        let ttl = class.ttl();
        tokio::spawn(async move {
            this.refresh(&logical, &skey, ttl).await;
            this.refreshing.remove(&skey);
        });
    }

    async fn refresh(&self, logical: &str, skey: &str, ttl: Duration) {
        match self.load_from_store(logical).await {
            Ok(Some(value)) => self.populate(skey, value, ttl).await,
            Ok(None) => {
                if let Err(e) = self.drop_cached(skey).await {
                    warn!(key = %skey, error = %e, "Could not drop entry removed from backing store");
                }
            }
            Err(e) => {
                warn!(key = %skey, error = %e, "Refresh-ahead failed, serving cached value until expiry")
            }
        }
    }

    // -------------------------------------------------------------------------
    // Backing store calls
    // -------------------------------------------------------------------------

    /// One backing-store call with per-attempt timeout and bounded retry
    async fn call_store<T, F, Fut>(&self, operation: &'static str, key: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.config.load_timeout();
        let metrics = &self.metrics;
        let op = &op;
        with_retry(&self.config.retry, operation, || async move {
            match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => {
                    metrics
                        .coordinator
                        .load_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    Err(Error::BackingStoreTimeout {
                        key: key.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        })
        .await
    }

    async fn load_from_store(&self, logical: &str) -> Result<Option<Bytes>> {
        self.metrics.coordinator.loads.fetch_add(1, Ordering::Relaxed);
        let result = self
            .call_store("backing_store_load", logical, || self.store.load(logical))
            .await;
        if let Err(e) = &result {
            self.metrics
                .coordinator
                .load_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(key = %logical, error = %e, "Backing store load failed");
        }
        result
    }

    async fn write_store(&self, logical: &str, value: Bytes) -> Result<()> {
        self.call_store("backing_store_store", logical, || {
            self.store.store(logical, value.clone())
        })
        .await?;
        self.metrics
            .coordinator
            .store_writes
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove_from_store(&self, logical: &str) -> Result<()> {
        self.call_store("backing_store_remove", logical, || self.store.remove(logical))
            .await?;
        self.metrics
            .coordinator
            .store_writes
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Tier maintenance
    // -------------------------------------------------------------------------

    /// Cache a value in both tiers; cache failures never fail the caller
    async fn populate(&self, skey: &str, value: Bytes, ttl: Duration) {
        self.store_local(skey, value.clone(), ttl).await;
        if let Err(e) = self.distributed.set(skey, value, ttl).await {
            self.degraded("set", skey, &e);
        }
    }

    async fn store_local(&self, skey: &str, value: Bytes, ttl: Duration) {
        if let Err(e) = self.local.set(skey, value, ttl).await {
            warn!(key = %skey, error = %e, "Local tier rejected value");
        }
    }

    /// Remove a key from both tiers and forget its dependency edges
    async fn drop_cached(&self, skey: &str) -> Result<bool> {
        let mut existed = self.local.delete(skey).await?;
        match self.distributed.delete(skey).await {
            Ok(found) => existed |= found,
            Err(Error::EmptyRing) => {}
            Err(e) => {
                self.degraded("delete", skey, &e);
                // Retried in the background by the invalidation engine
                self.invalidation.invalidate_key(skey).await?;
            }
        }
        self.invalidation.forget(skey);
        Ok(existed)
    }

    fn degraded(&self, operation: &str, key: &str, error: &Error) {
        match error {
            Error::EmptyRing => debug!(operation, key = %key, "No distributed nodes, local tier only"),
            _ => warn!(operation, key = %key, error = %error, "Distributed tier degraded"),
        }
    }

    async fn write(
        &self,
        key: &CacheKey,
        skey: &str,
        value: Bytes,
        class: &DataClassConfig,
        keep_cached: bool,
    ) -> Result<()> {
        let logical = key.logical_key();
        match class.pattern {
            WritePattern::CacheAside if !keep_cached => {
                self.write_store(&logical, value).await?;
                self.drop_cached(skey).await?;
            }
            WritePattern::WriteBehind => {
                let op = if self.local.store().peek(skey).is_some() {
                    WriteOp::Update
                } else {
                    WriteOp::Create
                };
                self.write_behind
                    .enqueue(WriteBehindOperation::upsert(op, logical, value.clone()))
                    .await?;
                self.populate(skey, value, class.ttl()).await;
            }
            _ => {
                self.write_store(&logical, value.clone()).await?;
                self.populate(skey, value, class.ttl()).await;
            }
        }
        debug!(key = %skey, pattern = ?class.pattern, "Write applied");
        Ok(())
    }
}

/// TTL for copying a distributed hit into the local tier, `None` if already expired
fn local_ttl(remaining: Option<Duration>) -> Option<Duration> {
    match remaining {
        None => Some(Duration::ZERO),
        Some(left) if left.is_zero() => None,
        Some(left) => Some(left),
    }
}

#[async_trait]
impl RiskCache for Coordinator {
    async fn get(&self, key: &CacheKey) -> Result<ReadResult> {
        let skey = self.storage_key(key);
        let class = self.config.class_for(&key.namespace);
        self.tracker.record(&key.logical_key());

        if let Lookup::Hit(hit) = self.local.get(&skey).await? {
            self.on_hit(key, &skey, TierKind::Local, class, hit.remaining_ttl);
            return Ok(ReadResult::Cached {
                value: hit.value,
                tier: TierKind::Local,
            });
        }

        match self.distributed.get(&skey).await {
            Ok(Lookup::Hit(hit)) if self.invalidation.superseded(&skey, hit.stored_at) => {
                debug!(key = %skey, "Distributed copy predates a pending invalidation, skipped");
            }
            Ok(Lookup::Hit(hit)) => {
                if let Some(ttl) = local_ttl(hit.remaining_ttl) {
                    self.store_local(&skey, hit.value.clone(), ttl).await;
                }
                self.on_hit(key, &skey, TierKind::Distributed, class, hit.remaining_ttl);
                return Ok(ReadResult::Cached {
                    value: hit.value,
                    tier: TierKind::Distributed,
                });
            }
            Ok(Lookup::Miss) => {}
            Err(e) => self.degraded("get", &skey, &e),
        }

        self.events.publish(CacheEvent::Miss { key: skey.clone() });
        self.load_through(key, &skey, class).await
    }

    async fn set(&self, key: &CacheKey, value: Bytes) -> Result<()> {
        let skey = self.storage_key(key);
        let class = self.config.class_for(&key.namespace);
        self.write(key, &skey, value, class, false).await
    }

    async fn set_with_dependencies(
        &self,
        key: &CacheKey,
        value: Bytes,
        dependencies: &[String],
    ) -> Result<()> {
        let resolved = self.invalidation.generations().resolve(key);
        let skey = resolved.to_storage_key();
        let class = self.config.class_for(&key.namespace);
        self.write(key, &skey, value, class, true).await?;
        self.invalidation
            .record_versioned_dependencies(&resolved, dependencies);
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<bool> {
        let skey = self.storage_key(key);
        let logical = key.logical_key();
        if self.config.class_for(&key.namespace).pattern == WritePattern::WriteBehind {
            // Queued first so a read racing the drop sees the pending delete
            self.write_behind
                .enqueue(WriteBehindOperation::delete(logical))
                .await?;
            return self.drop_cached(&skey).await;
        }
        self.remove_from_store(&logical).await?;
        self.drop_cached(&skey).await
    }

    async fn touch(&self, key: &CacheKey) -> Result<bool> {
        let skey = self.storage_key(key);
        let local = self.local.touch(&skey).await?;
        let remote = match self.distributed.touch(&skey).await {
            Ok(found) => found,
            Err(e) => {
                self.degraded("touch", &skey, &e);
                false
            }
        };
        Ok(local || remote)
    }

    async fn invalidate_pattern(&self, pattern: &str) -> Result<InvalidationReport> {
        let pattern = KeyPattern::parse(pattern)?;
        self.invalidation.invalidate_pattern(&pattern).await
    }

    async fn invalidate_dependency(&self, dependency: &str) -> Result<InvalidationReport> {
        self.invalidation.invalidate_dependency(dependency).await
    }

    fn bump_generation(&self, namespace: &str) -> u64 {
        self.invalidation.bump_generation(namespace)
    }

    async fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        if !self.router().is_empty() {
            snapshot.shards = self.distributed.distribution().await;
        }
        snapshot
    }

    async fn health_check(&self) -> Result<bool> {
        if !self.write_behind.is_accepting() {
            return Ok(false);
        }
        self.distributed.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LocalNode, MemoryStore};
    use crate::cache::invalidation::Propagation;
    use crate::cache::tier::TierConfig;
    use assert_matches::assert_matches;

    struct Harness {
        engine: Arc<Coordinator>,
        store: Arc<MemoryStore>,
        nodes: Vec<Arc<LocalNode>>,
    }

    fn harness(classes: &[(&str, DataClassConfig)]) -> Harness {
        let mut config = EngineConfig::default();
        config.local = TierConfig::with_max_entries(100);
        config.load_timeout_ms = 100;
        config.retry.initial_backoff_ms = 1;
        config.retry.max_backoff_ms = 2;
        for (ns, class) in classes {
            config.data_classes.insert(ns.to_string(), class.clone());
        }

        let store = Arc::new(MemoryStore::new());
        let nodes: Vec<Arc<LocalNode>> = ["n1", "n2"]
            .iter()
            .map(|id| Arc::new(LocalNode::new(*id, TierConfig::with_max_entries(100))))
            .collect();
        let shared = nodes.iter().map(|n| Arc::clone(n) as SharedCacheNode).collect();
        let engine = Coordinator::new(config, Arc::clone(&store) as SharedBackingStore, shared).unwrap();
        Harness {
            engine,
            store,
            nodes,
        }
    }

    #[tokio::test]
    async fn test_cache_aside_read_populates_tiers() {
        let h = harness(&[]);
        h.store.seed("features:acme", "0.42");
        let key = CacheKey::new("features", "acme");

        assert_eq!(
            h.engine.get(&key).await.unwrap(),
            ReadResult::Loaded {
                value: Bytes::from("0.42")
            }
        );
        assert_eq!(
            h.engine.get(&key).await.unwrap(),
            ReadResult::Cached {
                value: Bytes::from("0.42"),
                tier: TierKind::Local
            }
        );
        assert_eq!(h.store.load_count(), 1);

        // Local copy gone: served from the distributed tier and copied back
        h.engine.local().clear().await.unwrap();
        assert_matches!(
            h.engine.get(&key).await.unwrap(),
            ReadResult::Cached {
                tier: TierKind::Distributed,
                ..
            }
        );
        assert!(h.engine.local().store().peek("features:acme:v0").is_some());
    }

    #[tokio::test]
    async fn test_not_found_is_not_an_error() {
        let h = harness(&[]);
        let result = h.engine.get(&CacheKey::new("features", "nobody")).await.unwrap();
        assert_eq!(result, ReadResult::NotFound);
        assert!(!result.is_hit());
    }

    #[tokio::test]
    async fn test_cache_aside_write_drops_entry() {
        let h = harness(&[]);
        h.store.seed("features:acme", "old");
        let key = CacheKey::new("features", "acme");
        h.engine.get(&key).await.unwrap();

        h.engine.set(&key, Bytes::from("new")).await.unwrap();
        assert_eq!(h.engine.cached(&key).await.unwrap(), None);
        assert_eq!(h.engine.get(&key).await.unwrap().value(), Some(&Bytes::from("new")));
    }

    #[tokio::test]
    async fn test_write_through_caches_new_value() {
        let h = harness(&[(
            "session",
            DataClassConfig::new(WritePattern::WriteThrough, Duration::from_secs(60)),
        )]);
        let key = CacheKey::new("session", "u1");
        h.engine.set(&key, Bytes::from("token")).await.unwrap();

        assert_eq!(h.store.peek("session:u1"), Some(Bytes::from("token")));
        assert_eq!(
            h.engine.cached(&key).await.unwrap(),
            Some((Bytes::from("token"), TierKind::Local))
        );
    }

    #[tokio::test]
    async fn test_write_behind_acknowledges_before_store() {
        let h = harness(&[(
            "audit",
            DataClassConfig::new(WritePattern::WriteBehind, Duration::from_secs(60)),
        )]);
        h.store.set_latency(Duration::from_millis(20));
        let key = CacheKey::new("audit", "evt-1");

        h.engine.set(&key, Bytes::from("payload")).await.unwrap();
        assert!(h.engine.cached(&key).await.unwrap().is_some());
        h.engine.flush().await.unwrap();
        assert_eq!(h.store.peek("audit:evt-1"), Some(Bytes::from("payload")));

        h.engine.delete(&key).await.unwrap();
        h.engine.flush().await.unwrap();
        assert_eq!(h.store.peek("audit:evt-1"), None);
    }

    #[tokio::test]
    async fn test_write_behind_delete_hides_record_until_applied() {
        let h = harness(&[(
            "audit",
            DataClassConfig::new(WritePattern::WriteBehind, Duration::from_secs(60)),
        )]);
        let key = CacheKey::new("audit", "evt-1");
        h.engine.set(&key, Bytes::from("payload")).await.unwrap();
        h.engine.flush().await.unwrap();
        h.store.set_latency(Duration::from_millis(20));

        assert!(h.engine.delete(&key).await.unwrap());
        assert_eq!(h.engine.get(&key).await.unwrap(), ReadResult::NotFound);
        h.engine.flush().await.unwrap();
        assert_eq!(h.store.peek("audit:evt-1"), None);
        assert_eq!(h.engine.get(&key).await.unwrap(), ReadResult::NotFound);
        assert_eq!(h.engine.cached(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_behind_pending_value_survives_eviction() {
        let h = harness(&[(
            "audit",
            DataClassConfig::new(WritePattern::WriteBehind, Duration::from_secs(60)),
        )]);
        h.store.seed("audit:evt-2", "v1");
        h.store.set_latency(Duration::from_millis(50));
        let key = CacheKey::new("audit", "evt-2");

        h.engine.set(&key, Bytes::from("v2")).await.unwrap();
        h.engine.local().clear().await.unwrap();
        h.engine.distributed().clear().await.unwrap();

        assert_eq!(
            h.engine.get(&key).await.unwrap(),
            ReadResult::Loaded {
                value: Bytes::from("v2")
            }
        );
        assert_eq!(h.store.load_count(), 0);
        h.engine.flush().await.unwrap();
        assert_eq!(h.store.peek("audit:evt-2"), Some(Bytes::from("v2")));
    }

    #[tokio::test]
    async fn test_backing_store_failure_surfaces() {
        let h = harness(&[]);
        h.store.set_available(false);
        let result = h.engine.get(&CacheKey::new("features", "acme")).await;
        assert_matches!(result, Err(Error::BackingStoreUnavailable { .. }));
        // Three attempts under the default retry policy
        assert_eq!(h.store.load_count(), 3);
        assert_eq!(
            h.engine.metrics().coordinator.load_failures.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_backing_store_timeout() {
        let h = harness(&[]);
        h.store.set_latency(Duration::from_millis(500));
        let result = h.engine.get(&CacheKey::new("features", "slow")).await;
        assert_matches!(result, Err(Error::BackingStoreTimeout { timeout_ms: 100, .. }));
        assert_eq!(h.engine.cached(&CacheKey::new("features", "slow")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refresh_ahead_reloads_in_background() {
        let h = harness(&[(
            "model",
            DataClassConfig::new(WritePattern::RefreshAhead, Duration::from_millis(300))
                .with_refresh_window(Duration::from_millis(250)),
        )]);
        h.store.seed("model:lstm:acme", "v1");
        let key = CacheKey::new("model:lstm", "acme");
        h.engine.get(&key).await.unwrap();

        h.store.seed("model:lstm:acme", "v2");
        tokio::time::sleep(Duration::from_millis(100)).await;
        // Inside the refresh window: stale value now, fresh one shortly after
        assert_eq!(h.engine.get(&key).await.unwrap().value(), Some(&Bytes::from("v1")));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.engine.cached(&key).await.unwrap().map(|(v, _)| v),
            Some(Bytes::from("v2"))
        );
        assert_eq!(h.engine.metrics().coordinator.refreshes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_generation_bump_orphans_keys() {
        let h = harness(&[]);
        h.store.seed("model:lstm:acme", "weights");
        h.store.seed("session:u1", "s");
        let model = CacheKey::new("model:lstm", "acme");
        let session = CacheKey::new("session", "u1");
        h.engine.get(&model).await.unwrap();
        h.engine.get(&session).await.unwrap();

        assert_eq!(h.engine.bump_generation("model:lstm"), 1);
        assert_eq!(h.engine.cached(&model).await.unwrap(), None);
        assert!(h.engine.cached(&session).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_dependency_cascade() {
        let h = harness(&[]);
        let a = CacheKey::new("score", "a");
        let b = CacheKey::new("score", "b");
        let deps = vec!["features:acme".to_string()];
        h.engine.set_with_dependencies(&a, Bytes::from("1"), &deps).await.unwrap();
        h.engine.set_with_dependencies(&b, Bytes::from("2"), &deps).await.unwrap();
        assert!(h.engine.cached(&a).await.unwrap().is_some());

        let report = h.engine.invalidate_dependency("features:acme").await.unwrap();
        assert_eq!(report.local_removed, 2);
        assert!(h.engine.invalidation().drain(Duration::from_secs(5)).await);
        assert_eq!(h.engine.cached(&a).await.unwrap(), None);
        assert_eq!(h.engine.cached(&b).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_during_pending_invalidation_is_fresh() {
        let h = harness(&[]);
        h.store.seed("features:acme", "old");
        let key = CacheKey::new("features", "acme");
        h.engine.get(&key).await.unwrap();
        h.store.seed("features:acme", "new");

        let report = h.engine.invalidate_pattern("features:acme").await.unwrap();
        assert_eq!(report.remote, Propagation::Pending);
        assert_eq!(h.engine.cached(&key).await.unwrap(), None);
        assert_eq!(
            h.engine.get(&key).await.unwrap(),
            ReadResult::Loaded {
                value: Bytes::from("new")
            }
        );

        assert!(h.engine.invalidation().drain(Duration::from_secs(5)).await);
        assert_eq!(h.engine.get(&key).await.unwrap().value(), Some(&Bytes::from("new")));
        assert_eq!(
            h.engine.cached(&key).await.unwrap().map(|(v, _)| v),
            Some(Bytes::from("new"))
        );
    }

    #[tokio::test]
    async fn test_dependency_edges_released() {
        let h = harness(&[(
            "score",
            DataClassConfig::new(WritePattern::WriteThrough, Duration::from_millis(100)),
        )]);
        let deps = vec!["features:acme".to_string()];
        let graph = h.engine.invalidation().dependencies();

        for i in 0..50 {
            let key = CacheKey::new("score", i.to_string());
            h.engine.set_with_dependencies(&key, Bytes::from("1"), &deps).await.unwrap();
        }
        assert_eq!(graph.edge_count(), 50);

        // Still cached: edges stay
        assert_eq!(h.engine.sweep_expired().await.edges_pruned, 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        let report = h.engine.sweep_expired().await;
        assert_eq!(report.edges_pruned, 50);
        assert_eq!(graph.edge_count(), 0);

        for i in 0..10 {
            let key = CacheKey::new("model:lstm", i.to_string());
            h.engine.set_with_dependencies(&key, Bytes::from("w"), &deps).await.unwrap();
        }
        assert_eq!(graph.edge_count(), 10);
        h.engine.bump_generation("model:lstm");
        assert_eq!(graph.edge_count(), 0);
    }

    #[tokio::test]
    async fn test_pattern_invalidation_and_stats() {
        let h = harness(&[]);
        for i in 0..10 {
            h.store.seed(format!("session:{}", i), "s");
            h.engine.get(&CacheKey::new("session", i.to_string())).await.unwrap();
        }
        h.engine.invalidate_pattern("session:*").await.unwrap();
        assert!(h.engine.invalidation().drain(Duration::from_secs(5)).await);
        assert_eq!(h.engine.local().size().await.unwrap().entries, 0);
        assert_eq!(h.engine.distributed().size().await.unwrap().entries, 0);

        let stats = h.engine.stats().await;
        assert_eq!(stats.engine.loads, 10);
        assert_eq!(stats.shards.len(), 2);
        assert!(h.engine.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_node_degrades_to_backing_store() {
        let h = harness(&[]);
        h.store.seed("features:acme", "0.42");
        for node in &h.nodes {
            node.set_available(false);
        }
        let key = CacheKey::new("features", "acme");
        assert_eq!(h.engine.get(&key).await.unwrap().value(), Some(&Bytes::from("0.42")));
        assert!(!h.engine.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_warm_key() {
        let h = harness(&[]);
        h.store.seed("features:acme", "0.42");
        assert_eq!(h.engine.warm_key("features:acme").await.unwrap(), Some(4));
        assert_eq!(h.engine.warm_key("features:acme").await.unwrap(), None);
        assert_matches!(h.engine.warm_key("bare").await, Err(Error::InvalidKey { .. }));
        assert_eq!(h.store.load_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_write_behind() {
        let h = harness(&[]);
        h.engine.shutdown(Duration::from_secs(1)).await;
        assert!(!h.engine.health_check().await.unwrap());
    }

    #[test]
    fn test_local_ttl() {
        assert_eq!(local_ttl(None), Some(Duration::ZERO));
        assert_eq!(local_ttl(Some(Duration::ZERO)), None);
        assert_eq!(local_ttl(Some(Duration::from_secs(3))), Some(Duration::from_secs(3)));
    }
}
