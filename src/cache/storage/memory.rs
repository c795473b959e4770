//! Process-Local Tier
//!
//! The fastest tier: a [`BoundedStore`] in this process, fronted by the codec.

use crate::cache::codec::Codec;
use crate::cache::entry::{CacheEntry, CachedValue};
use crate::cache::events::{CacheEvent, EventBus, EvictionReason};
use crate::cache::invalidation::KeyPattern;
use crate::cache::metrics::{CacheMetrics, TierMetrics};
use crate::cache::storage::{BoundedStore, Lookup, SetOutcome, StoreRead, TierSize, TierStorage};
use crate::cache::tier::{TierConfig, TierKind};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Process-local cache tier
pub struct LocalTier {
    store: BoundedStore,
    codec: Codec,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
}

impl LocalTier {
    /// Create a tier with its own metrics and event bus
    pub fn new(config: TierConfig, codec: Codec) -> Self {
        Self::with_observers(config, codec, Arc::new(CacheMetrics::new()), EventBus::default())
    }

    /// Create a tier reporting into shared metrics and events
    pub fn with_observers(
        config: TierConfig,
        codec: Codec,
        metrics: Arc<CacheMetrics>,
        events: EventBus,
    ) -> Self {
        Self {
            store: BoundedStore::new(config),
            codec,
            metrics,
            events,
        }
    }

    /// Underlying store
    pub fn store(&self) -> &BoundedStore {
        &self.store
    }

    fn tier_metrics(&self) -> &TierMetrics {
        self.metrics.tier(TierKind::Local)
    }

    fn publish_occupancy(&self) {
        self.tier_metrics()
            .set_occupancy(self.store.len() as u64, self.store.bytes());
    }
}

#[async_trait]
impl TierStorage for LocalTier {
    fn kind(&self) -> TierKind {
        TierKind::Local
    }

    async fn get(&self, key: &str) -> Result<Lookup> {
        let started = Instant::now();
        let metrics = self.tier_metrics();

        let lookup = match self.store.get(key) {
            StoreRead::Hit(entry) => match self.codec.decode(&entry.value) {
                Ok(value) => {
                    metrics.record_hit();
                    Lookup::Hit(CachedValue {
                        value,
                        version: entry.version,
                        remaining_ttl: entry.remaining_ttl(),
                        stored_at: entry.stored_at,
                    })
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Dropping undecodable local entry");
                    self.store.remove(key);
                    metrics.record_codec_failure();
                    metrics.record_miss();
                    self.publish_occupancy();
                    self.events
                        .publish(CacheEvent::evicted(key, TierKind::Local, EvictionReason::Corrupted));
                    Lookup::Miss
                }
            },
            StoreRead::Expired => {
                metrics.record_expirations(1);
                metrics.record_miss();
                self.publish_occupancy();
                self.events
                    .publish(CacheEvent::evicted(key, TierKind::Local, EvictionReason::Expired));
                Lookup::Miss
            }
            StoreRead::Miss => {
                metrics.record_miss();
                Lookup::Miss
            }
        };

        metrics.record_latency(started.elapsed());
        Ok(lookup)
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<SetOutcome> {
        let encoded = self.codec.encode(&value);
        let entry = CacheEntry::new(key, encoded.frame, ttl, encoded.compressed);
        let size_bytes = entry.stored_size();
        let outcome = self.store.insert(entry);
        let metrics = self.tier_metrics();

        match &outcome {
            SetOutcome::Stored { evicted, .. } => {
                metrics.record_set();
                if !evicted.is_empty() {
                    metrics.record_evictions(evicted.len());
                    debug!(key = %key, evicted = evicted.len(), "Evicted least recently used entries");
                    for victim in evicted {
                        self.events.publish(CacheEvent::evicted(
                            victim.as_str(),
                            TierKind::Local,
                            EvictionReason::Capacity,
                        ));
                    }
                }
                self.events.publish(CacheEvent::Stored {
                    key: key.to_string(),
                    tier: TierKind::Local,
                    size_bytes,
                    compressed: encoded.compressed,
                });
            }
            SetOutcome::Rejected { capacity_bytes, .. } => {
                metrics.record_rejected();
                debug!(
                    key = %key,
                    size_bytes,
                    capacity_bytes,
                    "Entry larger than local tier capacity, not cached"
                );
                self.events.publish(CacheEvent::Rejected {
                    key: key.to_string(),
                    tier: TierKind::Local,
                    size_bytes,
                });
            }
        }

        self.publish_occupancy();
        Ok(outcome)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.store.remove(key).is_some();
        if existed {
            self.tier_metrics().record_delete();
            self.publish_occupancy();
            self.events.publish(CacheEvent::Deleted {
                key: key.to_string(),
                tier: TierKind::Local,
            });
        }
        Ok(existed)
    }

    async fn touch(&self, key: &str) -> Result<bool> {
        Ok(self.store.touch(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        Ok(self.store.expire(key, ttl))
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        let removed = self.store.remove_matching(|k| pattern.matches(k));
        if !removed.is_empty() {
            let metrics = self.tier_metrics();
            for _ in &removed {
                metrics.record_delete();
            }
            self.publish_occupancy();
        }
        Ok(removed)
    }

    async fn sweep_expired(&self) -> Result<usize> {
        let expired = self.store.sweep_expired();
        if !expired.is_empty() {
            self.tier_metrics().record_expirations(expired.len());
            self.publish_occupancy();
            for key in &expired {
                self.events
                    .publish(CacheEvent::evicted(key.as_str(), TierKind::Local, EvictionReason::Expired));
            }
        }
        Ok(expired.len())
    }

    async fn size(&self) -> Result<TierSize> {
        Ok(TierSize {
            entries: self.store.len() as u64,
            bytes: self.store.bytes(),
        })
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.store.keys())
    }

    async fn clear(&self) -> Result<()> {
        let removed = self.store.clear();
        debug!(removed, "Cleared local tier");
        self.publish_occupancy();
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::codec::CodecConfig;
    use assert_matches::assert_matches;

    fn tier(max_entries: usize) -> LocalTier {
        LocalTier::new(TierConfig::with_max_entries(max_entries), Codec::default())
    }

    #[tokio::test]
    async fn test_round_trip() {
        let tier = tier(10);
        tier.set("features:acme", Bytes::from("0.73"), Duration::from_secs(60))
            .await
            .unwrap();

        let value = tier.get("features:acme").await.unwrap().into_value().unwrap();
        assert_eq!(value.value, Bytes::from("0.73"));
        assert!(value.remaining_ttl.unwrap() <= Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_compressed_round_trip() {
        let tier = LocalTier::new(
            TierConfig::with_max_entries(10),
            Codec::new(CodecConfig {
                compression_threshold: 32,
                ..Default::default()
            }),
        );
        let payload = Bytes::from("feature-vector,".repeat(200));
        tier.set("features:big", payload.clone(), Duration::ZERO)
            .await
            .unwrap();

        let stored = tier.store().peek("features:big").unwrap();
        assert!(stored.compressed);
        assert_eq!(
            tier.get("features:big").await.unwrap().into_value().unwrap().value,
            payload
        );
    }

    #[tokio::test]
    async fn test_corrupt_frame_is_a_miss_and_dropped() {
        let tier = tier(10);
        tier.store().insert(CacheEntry::new(
            "features:bad",
            Bytes::from_static(&[0x09, 0x00, 1]),
            Duration::ZERO,
            false,
        ));

        assert_matches!(tier.get("features:bad").await.unwrap(), Lookup::Miss);
        assert!(tier.store().peek("features:bad").is_none());

        let snap = tier.metrics.local.snapshot(TierKind::Local);
        assert_eq!(snap.codec_failures, 1);
        assert_eq!(snap.misses, 1);
    }

    #[tokio::test]
    async fn test_delete_and_pattern_delete() {
        let tier = tier(10);
        for key in ["session:1", "session:2", "features:1"] {
            tier.set(key, Bytes::from("v"), Duration::ZERO).await.unwrap();
        }

        assert!(tier.delete("features:1").await.unwrap());
        assert!(!tier.delete("features:1").await.unwrap());

        let mut removed = tier
            .delete_matching(&KeyPattern::prefix("session:"))
            .await
            .unwrap();
        removed.sort();
        assert_eq!(removed, vec!["session:1", "session:2"]);
        assert_eq!(tier.size().await.unwrap(), TierSize::default());
    }

    #[tokio::test]
    async fn test_eviction_metrics_and_events() {
        let tier = tier(1);
        let mut events = tier.events.subscribe();
        tier.set("a:1", Bytes::from("x"), Duration::ZERO).await.unwrap();
        tier.set("a:2", Bytes::from("y"), Duration::ZERO).await.unwrap();

        let snap = tier.metrics.local.snapshot(TierKind::Local);
        assert_eq!(snap.evictions, 1);
        assert_eq!(snap.entries, 1);

        let mut saw_eviction = false;
        while let Ok(event) = events.try_recv() {
            if let CacheEvent::Evicted { key, reason, .. } = event {
                assert_eq!(key, "a:1");
                assert_eq!(reason, EvictionReason::Capacity);
                saw_eviction = true;
            }
        }
        assert!(saw_eviction);
    }
}
