//! Cache Events
//!
//! Events emitted by the engine for monitoring and observability. They are
//! published on a `tokio::sync::broadcast` channel; publishing never blocks
//! and events are dropped when nobody is subscribed.

use crate::cache::tier::TierKind;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the cache engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheEvent {
    /// Entry was stored in a tier
    Stored {
        key: String,
        tier: TierKind,
        size_bytes: u64,
        compressed: bool,
    },

    /// Entry was rejected because it can never fit the tier
    Rejected {
        key: String,
        tier: TierKind,
        size_bytes: u64,
    },

    /// Cache hit
    Hit { key: String, tier: TierKind },

    /// Cache miss (not found in any tier)
    Miss { key: String },

    /// Entry was deleted
    Deleted { key: String, tier: TierKind },

    /// Entry was removed without an explicit delete
    Evicted {
        key: String,
        tier: TierKind,
        reason: EvictionReason,
    },

    /// Event- or dependency-driven invalidation completed locally
    Invalidated { target: String, keys_removed: usize },

    /// Namespace generation was bumped
    GenerationBumped { namespace: String, generation: u64 },

    /// A remote node did not acknowledge an invalidation
    PropagationFailed {
        node_id: String,
        target: String,
        error: String,
    },

    /// Node joined the ring
    NodeAdded { node_id: String },

    /// Node left the ring
    NodeRemoved { node_id: String },

    /// Post-rebalance data migration finished
    MigrationComplete {
        keys_examined: usize,
        keys_moved: usize,
        keys_failed: usize,
    },

    /// Background refresh was started for a key about to expire
    RefreshScheduled { key: String },

    /// Write-behind operation could not be applied to the backing store
    WriteBehindFailed { key: String, error: String },

    /// Warming pass completed
    WarmingComplete {
        keys_requested: usize,
        keys_loaded: usize,
        bytes_loaded: u64,
    },
}

/// Reason for eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionReason {
    /// Capacity limit reached
    Capacity,
    /// Entry expired (TTL)
    Expired,
    /// Stored frame failed to decode
    Corrupted,
}

impl std::fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvictionReason::Capacity => write!(f, "capacity"),
            EvictionReason::Expired => write!(f, "expired"),
            EvictionReason::Corrupted => write!(f, "corrupted"),
        }
    }
}

impl CacheEvent {
    /// Create an Evicted event
    pub fn evicted(key: impl Into<String>, tier: TierKind, reason: EvictionReason) -> Self {
        CacheEvent::Evicted {
            key: key.into(),
            tier,
            reason,
        }
    }

    /// Get the key associated with this event (if any)
    pub fn key(&self) -> Option<&str> {
        match self {
            CacheEvent::Stored { key, .. }
            | CacheEvent::Rejected { key, .. }
            | CacheEvent::Hit { key, .. }
            | CacheEvent::Miss { key }
            | CacheEvent::Deleted { key, .. }
            | CacheEvent::Evicted { key, .. }
            | CacheEvent::RefreshScheduled { key }
            | CacheEvent::WriteBehindFailed { key, .. } => Some(key),
            _ => None,
        }
    }

    /// Get the tier associated with this event (if any)
    pub fn tier(&self) -> Option<TierKind> {
        match self {
            CacheEvent::Stored { tier, .. }
            | CacheEvent::Rejected { tier, .. }
            | CacheEvent::Hit { tier, .. }
            | CacheEvent::Deleted { tier, .. }
            | CacheEvent::Evicted { tier, .. } => Some(*tier),
            _ => None,
        }
    }

    /// Check if this is an error event
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            CacheEvent::PropagationFailed { .. } | CacheEvent::WriteBehindFailed { .. }
        )
    }
}

// =============================================================================
// Event Bus
// =============================================================================

/// Cloneable handle for publishing events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event (no-op without subscribers)
    pub fn publish(&self, event: CacheEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }
}
