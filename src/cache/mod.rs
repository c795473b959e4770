//! Multi-Tier Risk Cache
//!
//! A two-tier cache in front of the risk-scoring backing store:
//! - **Local**: process-local, size and entry bounded, LRU with lazy TTL
//! - **Distributed**: nodes sharded by a consistent-hash ring
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                             Coordinator                                  │
//! │   get ──► Local ──► Distributed ──► Singleflight ──► Backing Store       │
//! │   set ──► data class: cache-aside │ write-through │ write-behind │ ...   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐  ┌──────────────────────────┐  ┌──────────────────┐   │
//! │  │ Local Tier   │  │ Distributed Tier         │  │ Write-Behind     │   │
//! │  │ (DashMap +   │  │ (ShardRouter, 160 vnodes │  │ (per-key ordered │   │
//! │  │  LruIndex)   │  │  per node)               │  │  worker queues)  │   │
//! │  └──────────────┘  └──────────────────────────┘  └──────────────────┘   │
//! │         ▲                       ▲                                        │
//! │         └───────────┬───────────┘                                        │
//! │             ┌───────┴────────────┐   ┌──────────────────┐               │
//! │             │ Invalidation       │   │ Warmer           │               │
//! │             │ keys │ patterns │  │   │ proactive and    │               │
//! │             │ generations │ deps │   │ predictive       │               │
//! │             └────────────────────┘   └──────────────────┘               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use risk_cache::adapters::MemoryStore;
//! use risk_cache::cache::{CacheKey, Coordinator, ReadResult, RiskCache};
//! use risk_cache::config::EngineConfig;
//! use std::sync::Arc;
//!
//! let engine = Coordinator::new(EngineConfig::default(), Arc::new(MemoryStore::new()), nodes)?;
//!
//! let key = CacheKey::new("features", "acme-ltd");
//! match engine.get(&key).await? {
//!     ReadResult::Cached { value, tier } => println!("{} hit: {:?}", tier, value),
//!     ReadResult::Loaded { value } => println!("loaded: {:?}", value),
//!     ReadResult::NotFound => println!("no such business"),
//! }
//!
//! // A model retrain makes every cached score of that model stale
//! engine.bump_generation("model:lstm");
//! ```

pub mod codec;
pub mod coordinator;
pub mod entry;
pub mod events;
pub mod invalidation;
pub mod lru;
pub mod metrics;
pub mod retry;
pub mod shard;
pub mod singleflight;
pub mod storage;
pub mod tier;
pub mod warmer;
pub mod write_behind;

// Re-export main types
pub use codec::{Codec, CodecConfig, CompressionAlgorithm};
pub use coordinator::{Coordinator, DataClassConfig, WritePattern};
pub use entry::{CacheEntry, CacheKey, CachedValue};
pub use events::{CacheEvent, EventBus, EvictionReason};
pub use invalidation::{
    DependencyGraph, GenerationRegistry, InvalidationConfig, InvalidationEngine,
    InvalidationReport, KeyPattern, Propagation, SweepReport,
};
pub use lru::LruIndex;
pub use metrics::{CacheMetrics, ShardStats, StatsSnapshot, TierMetricsSnapshot};
pub use retry::{with_retry, RetryConfig};
pub use shard::{HashRing, MigrationReport, ShardRouter, DEFAULT_REPLICAS};
pub use singleflight::{LoadFailure, Singleflight};
pub use storage::{BoundedStore, DistributedTier, LocalTier, Lookup, SetOutcome, TierSize, TierStorage};
pub use tier::{TierConfig, TierKind};
pub use warmer::{AccessTracker, CacheWarmer, PredictiveConfig, WarmReport, WarmerConfig};
pub use write_behind::{
    PendingWrite, WriteBehindConfig, WriteBehindOperation, WriteBehindQueue, WriteOp,
};

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

// =============================================================================
// Read Result
// =============================================================================

/// Result of a read through the tiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadResult {
    /// Served from a cache tier
    Cached { value: Bytes, tier: TierKind },
    /// Loaded from the backing store and cached
    Loaded { value: Bytes },
    /// Absent from the backing store too
    NotFound,
}

impl ReadResult {
    /// Check if a cache tier answered
    pub fn is_hit(&self) -> bool {
        matches!(self, ReadResult::Cached { .. })
    }

    pub fn is_found(&self) -> bool {
        !matches!(self, ReadResult::NotFound)
    }

    /// Get the value, wherever it came from
    pub fn value(&self) -> Option<&Bytes> {
        match self {
            ReadResult::Cached { value, .. } | ReadResult::Loaded { value } => Some(value),
            ReadResult::NotFound => None,
        }
    }

    /// Tier that served a hit
    pub fn tier(&self) -> Option<TierKind> {
        match self {
            ReadResult::Cached { tier, .. } => Some(*tier),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<Bytes> {
        match self {
            ReadResult::Cached { value, .. } | ReadResult::Loaded { value } => Some(value),
            ReadResult::NotFound => None,
        }
    }
}

// =============================================================================
// RiskCache Trait (Port)
// =============================================================================

/// Caller-facing cache operations
///
/// Keys passed in are logical (`namespace:id`); generation tags are applied
/// internally.
#[async_trait]
pub trait RiskCache: Send + Sync {
    /// Read through local tier, distributed tier and backing store
    ///
    /// Concurrent misses on one key share a single backing-store load.
    async fn get(&self, key: &CacheKey) -> Result<ReadResult>;

    /// Write a value following the key's data-class pattern
    async fn set(&self, key: &CacheKey, value: Bytes) -> Result<()>;

    /// Write a value and register the dependencies it was derived from
    ///
    /// The value stays cached regardless of pattern so the dependency edges
    /// have something to invalidate.
    async fn set_with_dependencies(
        &self,
        key: &CacheKey,
        value: Bytes,
        dependencies: &[String],
    ) -> Result<()>;

    /// Remove from backing store and both tiers
    ///
    /// Returns true if a cached copy existed.
    async fn delete(&self, key: &CacheKey) -> Result<bool>;

    /// Restart the TTL of a cached key
    async fn touch(&self, key: &CacheKey) -> Result<bool>;

    /// Invalidate every cached key matching a glob or prefix pattern
    async fn invalidate_pattern(&self, pattern: &str) -> Result<InvalidationReport>;

    /// Invalidate every key registered as depending on `dependency`
    async fn invalidate_dependency(&self, dependency: &str) -> Result<InvalidationReport>;

    /// Bump a namespace generation, orphaning its cached keys
    fn bump_generation(&self, namespace: &str) -> u64;

    /// Current statistics
    async fn stats(&self) -> StatsSnapshot;

    /// Check if the engine can serve traffic
    async fn health_check(&self) -> Result<bool>;
}

/// Type alias for Arc'd RiskCache
pub type RiskCacheRef = Arc<dyn RiskCache>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_result_accessors() {
        let hit = ReadResult::Cached {
            value: Bytes::from("0.87"),
            tier: TierKind::Distributed,
        };
        assert!(hit.is_hit());
        assert!(hit.is_found());
        assert_eq!(hit.value(), Some(&Bytes::from("0.87")));
        assert_eq!(hit.tier(), Some(TierKind::Distributed));

        let loaded = ReadResult::Loaded {
            value: Bytes::from("0.12"),
        };
        assert!(!loaded.is_hit());
        assert_eq!(loaded.tier(), None);
        assert_eq!(loaded.into_value(), Some(Bytes::from("0.12")));

        let missing = ReadResult::NotFound;
        assert!(!missing.is_found());
        assert_eq!(missing.value(), None);
    }
}
