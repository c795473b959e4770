//! Domain Ports - Core trait definitions for the cache engine
//!
//! These traits define the boundaries between the engine and external systems.
//! Adapters implement these traits to provide concrete functionality.

use crate::cache::entry::CacheEntry;
use crate::cache::invalidation::KeyPattern;
use crate::cache::storage::{SetOutcome, StoreRead, TierSize};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Backing Store Port
// =============================================================================

/// Port for the authoritative data source behind the cache
///
/// Keys are logical keys (`namespace:id`); generation tags never reach the
/// backing store.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Load a value; `Ok(None)` means the record does not exist
    async fn load(&self, key: &str) -> Result<Option<Bytes>>;

    /// Create or replace a value
    async fn store(&self, key: &str, value: Bytes) -> Result<()>;

    /// Remove a value (removing an absent key is not an error)
    async fn remove(&self, key: &str) -> Result<()>;

    /// Most frequently or recently accessed keys, best first
    ///
    /// Used to seed the warmer at startup. Stores that do not track access
    /// return nothing.
    async fn popular_keys(&self, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Shared backing store handle
pub type SharedBackingStore = Arc<dyn BackingStore>;

// =============================================================================
// Cache Node Port
// =============================================================================

/// Port for one node of the distributed tier
///
/// Nodes store encoded entries as-is; decoding happens in the tier. A node
/// applies the same capacity and lazy-expiry rules as the local tier.
#[async_trait]
pub trait CacheNode: Send + Sync {
    /// Stable node identifier used on the hash ring
    fn id(&self) -> &str;

    /// Read an entry
    async fn get(&self, key: &str) -> Result<StoreRead>;

    /// Store an entry, keeping its timestamp and TTL
    async fn set(&self, entry: CacheEntry) -> Result<SetOutcome>;

    /// Delete a key, returning whether it was present
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Restart the TTL of a live key
    async fn touch(&self, key: &str) -> Result<bool>;

    /// Give a live key a new TTL
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete every key matching a pattern
    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>>;

    /// Remove expired entries
    async fn sweep_expired(&self) -> Result<usize>;

    /// All live keys
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove everything
    async fn clear(&self) -> Result<()>;

    /// Current occupancy
    async fn size(&self) -> Result<TierSize>;

    /// Liveness probe
    async fn ping(&self) -> Result<()>;
}

/// Shared cache node handle
pub type SharedCacheNode = Arc<dyn CacheNode>;
