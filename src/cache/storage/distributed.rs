//! Distributed Tier
//!
//! Spreads keys over cache nodes with the [`ShardRouter`]. While a ring
//! migration is running, a miss on a key's new owner is retried against its
//! previous owner; a value found there is copied forward so the next read
//! hits directly.

use crate::cache::codec::Codec;
use crate::cache::entry::{CacheEntry, CachedValue};
use crate::cache::events::{CacheEvent, EventBus, EvictionReason};
use crate::cache::invalidation::KeyPattern;
use crate::cache::metrics::{CacheMetrics, ShardStats, TierMetrics};
use crate::cache::shard::ShardRouter;
use crate::cache::storage::{Lookup, SetOutcome, StoreRead, TierSize, TierStorage};
use crate::cache::tier::TierKind;
use crate::domain::ports::SharedCacheNode;
use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sharded cache tier over distributed nodes
pub struct DistributedTier {
    router: Arc<ShardRouter>,
    codec: Codec,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
}

impl DistributedTier {
    pub fn new(
        router: Arc<ShardRouter>,
        codec: Codec,
        metrics: Arc<CacheMetrics>,
        events: EventBus,
    ) -> Self {
        Self {
            router,
            codec,
            metrics,
            events,
        }
    }

    pub fn router(&self) -> &Arc<ShardRouter> {
        &self.router
    }

    /// Key count and bytes per node
    pub async fn distribution(&self) -> Vec<ShardStats> {
        self.router.distribution().await
    }

    fn tier_metrics(&self) -> &TierMetrics {
        self.metrics.tier(TierKind::Distributed)
    }

    async fn publish_occupancy(&self) {
        if let Ok(size) = self.size().await {
            self.tier_metrics().set_occupancy(size.entries, size.bytes);
        }
    }

    /// Read from the owner, then from the previous owner during migration
    async fn read_entry(&self, key: &str) -> Result<Option<(SharedCacheNode, CacheEntry)>> {
        let owner = self.router.route(key)?;
        match owner.get(key).await? {
            StoreRead::Hit(entry) => return Ok(Some((owner, entry))),
            StoreRead::Expired => {
                self.tier_metrics().record_expirations(1);
                self.events.publish(CacheEvent::evicted(
                    key,
                    TierKind::Distributed,
                    EvictionReason::Expired,
                ));
            }
            StoreRead::Miss => {}
        }

        let Some(previous) = self.router.previous_owner(key) else {
            return Ok(None);
        };
        match previous.get(key).await {
            Ok(StoreRead::Hit(entry)) => {
                debug!(key = %key, from = %previous.id(), to = %owner.id(), "Served from previous owner");
                if let Err(e) = owner.set(entry.clone()).await {
                    debug!(key = %key, error = %e, "Copy-forward to new owner failed");
                }
                Ok(Some((owner, entry)))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                debug!(key = %key, node_id = %previous.id(), error = %e, "Previous owner unavailable");
                Ok(None)
            }
        }
    }

    /// Whether a live entry exists on the owner or, during migration, the
    /// previous owner
    pub async fn contains(&self, key: &str) -> Result<bool> {
        let owner = self.router.route(key)?;
        if matches!(owner.get(key).await?, StoreRead::Hit(_)) {
            return Ok(true);
        }
        match self.router.previous_owner(key) {
            Some(previous) => Ok(matches!(previous.get(key).await?, StoreRead::Hit(_))),
            None => Ok(false),
        }
    }

    /// Run an operation on every node, failing after all were attempted
    async fn on_every_node<T, F, Fut>(&self, op: F) -> Result<Vec<T>>
    where
        F: Fn(SharedCacheNode) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let results =
            futures::future::join_all(self.router.all_nodes().into_iter().map(op)).await;
        let mut values = Vec::with_capacity(results.len());
        let mut first_error: Option<Error> = None;
        for result in results {
            match result {
                Ok(v) => values.push(v),
                Err(e) => {
                    warn!(error = %e, "Distributed tier operation failed on a node");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(values),
        }
    }
}

#[async_trait]
impl TierStorage for DistributedTier {
    fn kind(&self) -> TierKind {
        TierKind::Distributed
    }

    async fn get(&self, key: &str) -> Result<Lookup> {
        let started = Instant::now();
        let found = self.read_entry(key).await;
        let metrics = self.tier_metrics();
        metrics.record_latency(started.elapsed());

        let Some((owner, entry)) = found? else {
            metrics.record_miss();
            return Ok(Lookup::Miss);
        };

        match self.codec.decode(&entry.value) {
            Ok(value) => {
                metrics.record_hit();
                Ok(Lookup::Hit(CachedValue {
                    value,
                    version: entry.version,
                    remaining_ttl: entry.remaining_ttl(),
                    stored_at: entry.stored_at,
                }))
            }
            Err(e) => {
                warn!(key = %key, node_id = %owner.id(), error = %e, "Dropping undecodable distributed entry");
                if let Err(e) = owner.delete(key).await {
                    debug!(key = %key, node_id = %owner.id(), error = %e, "Could not drop undecodable entry");
                }
                metrics.record_codec_failure();
                metrics.record_miss();
                self.events.publish(CacheEvent::evicted(
                    key,
                    TierKind::Distributed,
                    EvictionReason::Corrupted,
                ));
                Ok(Lookup::Miss)
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<SetOutcome> {
        let owner = self.router.route(key)?;
        let encoded = self.codec.encode(&value);
        let entry = CacheEntry::new(key, encoded.frame, ttl, encoded.compressed);
        let size_bytes = entry.stored_size();
        let outcome = owner.set(entry).await?;

        // A stale copy on the previous owner must not resurface via fallback
        if let Some(previous) = self.router.previous_owner(key) {
            if let Err(e) = previous.delete(key).await {
                debug!(key = %key, node_id = %previous.id(), error = %e, "Stale copy left on previous owner");
            }
        }

        let metrics = self.tier_metrics();
        match &outcome {
            SetOutcome::Stored { evicted, .. } => {
                metrics.record_set();
                metrics.record_evictions(evicted.len());
                for victim in evicted {
                    self.events.publish(CacheEvent::evicted(
                        victim.as_str(),
                        TierKind::Distributed,
                        EvictionReason::Capacity,
                    ));
                }
                self.events.publish(CacheEvent::Stored {
                    key: key.to_string(),
                    tier: TierKind::Distributed,
                    size_bytes,
                    compressed: encoded.compressed,
                });
            }
            SetOutcome::Rejected { capacity_bytes, .. } => {
                metrics.record_rejected();
                debug!(
                    key = %key,
                    node_id = %owner.id(),
                    size_bytes,
                    capacity_bytes,
                    "Entry larger than node capacity, not cached"
                );
                self.events.publish(CacheEvent::Rejected {
                    key: key.to_string(),
                    tier: TierKind::Distributed,
                    size_bytes,
                });
            }
        }
        Ok(outcome)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let owner = self.router.route(key)?;
        let mut existed = owner.delete(key).await?;
        if let Some(previous) = self.router.previous_owner(key) {
            existed |= previous.delete(key).await?;
        }
        if existed {
            self.tier_metrics().record_delete();
            self.events.publish(CacheEvent::Deleted {
                key: key.to_string(),
                tier: TierKind::Distributed,
            });
        }
        Ok(existed)
    }

    async fn touch(&self, key: &str) -> Result<bool> {
        self.router.route(key)?.touch(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.router.route(key)?.expire(key, ttl).await
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        let removed: Vec<String> = self
            .on_every_node(|node| async move { node.delete_matching(pattern).await })
            .await?
            .into_iter()
            .flatten()
            .collect();
        for _ in &removed {
            self.tier_metrics().record_delete();
        }
        Ok(removed)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let swept: usize = self
            .on_every_node(|node| async move { node.sweep_expired().await })
            .await?
            .into_iter()
            .sum();
        if swept > 0 {
            self.tier_metrics().record_expirations(swept);
            self.publish_occupancy().await;
        }
        Ok(swept)
    }

    async fn size(&self) -> Result<TierSize> {
        let sizes = self
            .on_every_node(|node| async move { node.size().await })
            .await?;
        Ok(sizes.into_iter().fold(TierSize::default(), |acc, s| TierSize {
            entries: acc.entries + s.entries,
            bytes: acc.bytes + s.bytes,
        }))
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let keys: BTreeSet<String> = self
            .on_every_node(|node| async move { node.keys().await })
            .await?
            .into_iter()
            .flatten()
            .collect();
        Ok(keys.into_iter().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.on_every_node(|node| async move { node.clear().await })
            .await?;
        self.tier_metrics().set_occupancy(0, 0);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        if self.router.is_empty() {
            return Ok(false);
        }
        Ok(self
            .on_every_node(|node| async move { node.ping().await })
            .await
            .is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LocalNode;
    use crate::domain::ports::CacheNode;
    use crate::cache::shard::DEFAULT_REPLICAS;
    use crate::cache::tier::TierConfig;
    use assert_matches::assert_matches;

    fn tier_with(nodes: &[&str]) -> (DistributedTier, Vec<Arc<LocalNode>>) {
        let locals: Vec<Arc<LocalNode>> = nodes
            .iter()
            .map(|id| Arc::new(LocalNode::new(*id, TierConfig::with_max_entries(1000))))
            .collect();
        let shared: Vec<SharedCacheNode> = locals
            .iter()
            .map(|n| Arc::clone(n) as SharedCacheNode)
            .collect();
        let events = EventBus::default();
        let router = Arc::new(ShardRouter::with_nodes(DEFAULT_REPLICAS, shared, events.clone()));
        let tier = DistributedTier::new(router, Codec::default(), Arc::new(CacheMetrics::new()), events);
        (tier, locals)
    }

    #[tokio::test]
    async fn test_round_trip_lands_on_owner() {
        let (tier, locals) = tier_with(&["n1", "n2", "n3"]);
        tier.set("features:acme", Bytes::from("0.42"), Duration::from_secs(30))
            .await
            .unwrap();

        let owner = tier.router().route_id("features:acme").unwrap();
        for node in &locals {
            let holds = node.store().peek("features:acme").is_some();
            assert_eq!(holds, node.id() == owner);
        }
        let value = tier.get("features:acme").await.unwrap().into_value().unwrap();
        assert_eq!(value.value, Bytes::from("0.42"));
    }

    #[tokio::test]
    async fn test_contains_checks_owner() {
        let (tier, locals) = tier_with(&["n1", "n2"]);
        tier.set("features:acme", Bytes::from("0.42"), Duration::ZERO)
            .await
            .unwrap();
        assert!(tier.contains("features:acme").await.unwrap());
        assert!(!tier.contains("features:other").await.unwrap());

        for node in &locals {
            node.set_available(false);
        }
        assert_matches!(
            tier.contains("features:acme").await,
            Err(Error::NodeUnreachable { .. })
        );
    }

    #[tokio::test]
    async fn test_set_tolerates_unreachable_previous_owner() {
        let (tier, locals) = tier_with(&["n1"]);
        locals[0].set_available(false);
        let joining: SharedCacheNode = Arc::new(LocalNode::new("n2", TierConfig::with_max_entries(1000)));
        let handle = tier.router().add_node(joining).await.unwrap();

        let key = (0..200)
            .map(|i| format!("features:{}", i))
            .find(|k| tier.router().route_id(k).unwrap() == "n2")
            .unwrap();
        assert!(tier.router().previous_owner(&key).is_some());
        assert!(tier
            .set(&key, Bytes::from("v"), Duration::ZERO)
            .await
            .unwrap()
            .is_stored());

        handle.wait().await.unwrap();
        assert!(tier.contains(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_pattern_delete_reaches_all_nodes() {
        let (tier, _) = tier_with(&["n1", "n2", "n3"]);
        for i in 0..50 {
            tier.set(&format!("session:{}", i), Bytes::from("s"), Duration::ZERO)
                .await
                .unwrap();
        }
        tier.set("features:keep", Bytes::from("f"), Duration::ZERO)
            .await
            .unwrap();

        let removed = tier
            .delete_matching(&KeyPattern::prefix("session:"))
            .await
            .unwrap();
        assert_eq!(removed.len(), 50);
        assert_eq!(tier.keys().await.unwrap(), vec!["features:keep"]);
        assert_eq!(tier.size().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_unreachable_owner_surfaces_error() {
        let (tier, locals) = tier_with(&["only"]);
        locals[0].set_available(false);
        assert_matches!(
            tier.get("features:x").await,
            Err(Error::NodeUnreachable { .. })
        );
        assert!(!tier.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_ring() {
        let tier = DistributedTier::new(
            Arc::new(ShardRouter::new(DEFAULT_REPLICAS)),
            Codec::default(),
            Arc::new(CacheMetrics::new()),
            EventBus::default(),
        );
        assert_matches!(tier.get("k:1").await, Err(Error::EmptyRing));
        assert!(!tier.health_check().await.unwrap());
    }
}
