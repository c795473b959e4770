//! Cache Tier Definitions
//!
//! Defines the two-level hierarchy (process-local, distributed) and the
//! capacity rules each tier instance is constructed with.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Defaults
// =============================================================================

/// Default byte capacity of the process-local tier: 256 MB
pub const LOCAL_DEFAULT_CAPACITY_BYTES: u64 = 256 * 1024 * 1024;

/// Default byte capacity of a single distributed node: 1 GB
pub const NODE_DEFAULT_CAPACITY_BYTES: u64 = 1024 * 1024 * 1024;

// =============================================================================
// Tier Kind
// =============================================================================

/// Level of the cache hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierKind {
    /// In-process tier (fastest, smallest)
    #[default]
    Local,
    /// Sharded tier spread over cache nodes
    Distributed,
}

impl TierKind {
    /// All tiers in lookup order (local first)
    pub fn lookup_order() -> &'static [TierKind] {
        &[TierKind::Local, TierKind::Distributed]
    }

    /// Stable label used in metric names
    pub fn label(&self) -> &'static str {
        match self {
            TierKind::Local => "local",
            TierKind::Distributed => "distributed",
        }
    }
}

impl fmt::Display for TierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TierKind::Local => write!(f, "Local"),
            TierKind::Distributed => write!(f, "Distributed"),
        }
    }
}

// =============================================================================
// Tier Configuration
// =============================================================================

/// Capacity configuration for one bounded store
///
/// A limit of zero disables that dimension. Both limits are enforced lazily
/// on `set`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    /// Maximum total stored bytes
    pub capacity_bytes: u64,
    /// Maximum number of live entries
    pub max_entries: usize,
}

impl Default for TierConfig {
    fn default() -> Self {
        Self::local_default()
    }
}

impl TierConfig {
    /// Default for the process-local tier
    pub fn local_default() -> Self {
        Self {
            capacity_bytes: LOCAL_DEFAULT_CAPACITY_BYTES,
            max_entries: 100_000,
        }
    }

    /// Default for one distributed node
    pub fn node_default() -> Self {
        Self {
            capacity_bytes: NODE_DEFAULT_CAPACITY_BYTES,
            max_entries: 1_000_000,
        }
    }

    /// Entry-count bound only (used heavily by tests and small deployments)
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            capacity_bytes: 0,
            max_entries,
        }
    }

    /// Check whether a single entry of `size_bytes` could ever fit
    pub fn admits(&self, size_bytes: u64) -> bool {
        self.capacity_bytes == 0 || size_bytes <= self.capacity_bytes
    }

    /// Check whether the given occupancy is over either limit
    pub fn is_over(&self, entries: usize, bytes: u64) -> bool {
        (self.max_entries > 0 && entries > self.max_entries)
            || (self.capacity_bytes > 0 && bytes > self.capacity_bytes)
    }
}
