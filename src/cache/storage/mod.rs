//! Cache Tier Storage
//!
//! The [`TierStorage`] contract shared by both tiers, plus the bounded
//! in-memory store they are built on.

mod bounded;
mod distributed;
mod memory;

pub use bounded::{BoundedStore, StoreRead};
pub use distributed::DistributedTier;
pub use memory::LocalTier;

use crate::cache::entry::CachedValue;
use crate::cache::invalidation::KeyPattern;
use crate::cache::tier::TierKind;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// =============================================================================
// Outcomes
// =============================================================================

/// Result of a tier lookup
///
/// A miss is a normal outcome meaning "proceed to the next tier".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Hit(CachedValue),
    Miss,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn into_value(self) -> Option<CachedValue> {
        match self {
            Lookup::Hit(v) => Some(v),
            Lookup::Miss => None,
        }
    }
}

/// Result of a tier set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    /// Entry stored; `evicted` lists keys removed to make room
    Stored { version: u64, evicted: Vec<String> },
    /// Entry can never fit this tier and was not stored
    Rejected { size_bytes: u64, capacity_bytes: u64 },
}

impl SetOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, SetOutcome::Stored { .. })
    }
}

/// Current occupancy of a tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierSize {
    pub entries: u64,
    pub bytes: u64,
}

// =============================================================================
// TierStorage Trait
// =============================================================================

/// Operations every cache tier provides
///
/// Keys are storage keys (see [`CacheKey::to_storage_key`](crate::cache::CacheKey::to_storage_key)).
/// Values are raw bytes; each tier encodes them with its codec.
#[async_trait]
pub trait TierStorage: Send + Sync {
    /// Which level of the hierarchy this tier serves
    fn kind(&self) -> TierKind;

    /// Look up a key; expired or undecodable entries are a miss
    async fn get(&self, key: &str) -> Result<Lookup>;

    /// Store a value; a zero TTL means no expiry
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<SetOutcome>;

    /// Delete a key, returning whether it was present
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Reset the TTL of a live key
    async fn touch(&self, key: &str) -> Result<bool>;

    /// Replace the TTL of a live key
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete every key matching a pattern, returning the removed keys
    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>>;

    /// Remove all expired entries, returning how many were removed
    async fn sweep_expired(&self) -> Result<usize>;

    /// Current occupancy
    async fn size(&self) -> Result<TierSize>;

    /// All live keys
    ///
    /// Note: This may be expensive for large tiers.
    async fn keys(&self) -> Result<Vec<String>>;

    /// Remove everything
    async fn clear(&self) -> Result<()>;

    /// Check if the tier is available
    async fn health_check(&self) -> Result<bool>;
}
