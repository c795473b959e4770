//! Cache Entry Types
//!
//! Defines cache keys, stored entries, and the decoded value handed back to
//! callers.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

// =============================================================================
// Cache Key
// =============================================================================

/// Logical identifier for cached data
///
/// `generation` is filled in by the engine from the namespace's generation
/// tag; callers normally build keys with [`CacheKey::new`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    /// Data class (e.g., "session", "features", "model:lstm")
    pub namespace: String,
    /// Record identifier within the namespace
    pub id: String,
    /// Generation tag the key was built under
    pub generation: Option<u64>,
}

impl CacheKey {
    /// Create an unversioned key
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            generation: None,
        }
    }

    /// Create a key pinned to a generation
    pub fn versioned(namespace: impl Into<String>, id: impl Into<String>, generation: u64) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            generation: Some(generation),
        }
    }

    /// Same key at another generation
    pub fn at_generation(&self, generation: u64) -> Self {
        Self {
            namespace: self.namespace.clone(),
            id: self.id.clone(),
            generation: Some(generation),
        }
    }

    /// Key as known to the backing store (never carries a generation)
    pub fn logical_key(&self) -> String {
        format!("{}:{}", self.namespace, self.id)
    }

    /// Key as stored in the cache tiers
    pub fn to_storage_key(&self) -> String {
        match self.generation {
            Some(g) => format!("{}:{}:v{}", self.namespace, self.id, g),
            None => self.logical_key(),
        }
    }

    /// Parse a logical or storage key
    ///
    /// The namespace may itself contain ':' (e.g. "model:lstm"), so the id is
    /// taken as the last segment that is not a generation suffix.
    pub fn parse(key: &str) -> Option<Self> {
        let (rest, generation) = match key.rsplit_once(':') {
            Some((rest, last)) if last.starts_with('v') && last[1..].parse::<u64>().is_ok() => {
                (rest, last[1..].parse().ok())
            }
            _ => (key, None),
        };
        let (namespace, id) = rest.rsplit_once(':')?;
        if namespace.is_empty() {
            return None;
        }
        Some(Self {
            namespace: namespace.to_string(),
            id: id.to_string(),
            generation,
        })
    }
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.id.hash(state);
        self.generation.hash(state);
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_storage_key())
    }
}

// =============================================================================
// Cache Entry
// =============================================================================

/// A stored entry
///
/// Immutable once stored: an update replaces the whole entry. `value` holds
/// the codec frame, so `compressed` mirrors the frame tag for observability.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Storage key
    pub key: String,
    /// Encoded frame
    pub value: Bytes,
    /// Time the entry was stored
    pub stored_at: DateTime<Utc>,
    /// Time-to-live; zero means no expiry
    pub ttl: Duration,
    /// Monotonic write version assigned by the owning store
    pub version: u64,
    /// Whether the frame payload is compressed
    pub compressed: bool,
}

impl CacheEntry {
    /// Create a new entry stored now
    pub fn new(key: impl Into<String>, value: Bytes, ttl: Duration, compressed: bool) -> Self {
        Self {
            key: key.into(),
            value,
            stored_at: Utc::now(),
            ttl,
            version: 0,
            compressed,
        }
    }

    /// Expiry instant, if the entry has a TTL
    ///
    /// A TTL too large to represent as a timestamp never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl.is_zero() {
            return None;
        }
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.stored_at.checked_add_signed(ttl))
    }

    /// Check if the entry has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(at) => now >= at,
            None => false,
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Remaining lifetime (None = never expires)
    pub fn remaining_ttl(&self) -> Option<Duration> {
        let at = self.expires_at()?;
        Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    /// Stored size in bytes (key + frame)
    pub fn stored_size(&self) -> u64 {
        (self.key.len() + self.value.len()) as u64
    }

    /// Copy of this entry with a fresh timestamp and new TTL
    pub fn renewed(&self, ttl: Duration) -> Self {
        Self {
            stored_at: Utc::now(),
            ttl,
            ..self.clone()
        }
    }
}

// =============================================================================
// Cached Value
// =============================================================================

/// A decoded value returned from a tier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    /// Decoded bytes
    pub value: Bytes,
    /// Write version of the entry it came from
    pub version: u64,
    /// Remaining lifetime (None = never expires)
    pub remaining_ttl: Option<Duration>,
    /// Time the entry was stored
    pub stored_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_creation() {
        let key = CacheKey::new("session", "user-17");
        assert_eq!(key.generation, None);
        assert_eq!(key.logical_key(), "session:user-17");
        assert_eq!(key.to_storage_key(), "session:user-17");
    }

    #[test]
    fn test_cache_key_versioned() {
        let key = CacheKey::versioned("model:lstm", "acme", 3);
        assert_eq!(key.to_storage_key(), "model:lstm:acme:v3");
        assert_eq!(key.logical_key(), "model:lstm:acme");
        assert_eq!(key.at_generation(4).to_storage_key(), "model:lstm:acme:v4");
    }

    #[test]
    fn test_cache_key_parsing() {
        let key = CacheKey::parse("features:acme").unwrap();
        assert_eq!(key.namespace, "features");
        assert_eq!(key.id, "acme");
        assert_eq!(key.generation, None);

        let key = CacheKey::parse("model:lstm:acme:v12").unwrap();
        assert_eq!(key.namespace, "model:lstm");
        assert_eq!(key.id, "acme");
        assert_eq!(key.generation, Some(12));

        assert!(CacheKey::parse("no-namespace").is_none());
    }

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let entry = CacheEntry::new("a", Bytes::from("x"), Duration::ZERO, false);
        assert!(entry.expires_at().is_none());
        assert!(!entry.is_expired());
        assert!(entry.remaining_ttl().is_none());
    }

    #[test]
    fn test_entry_expiry() {
        let entry = CacheEntry::new("a", Bytes::from("x"), Duration::from_millis(100), false);
        assert!(!entry.is_expired());
        let later = entry.stored_at + chrono::Duration::milliseconds(150);
        assert!(entry.is_expired_at(later));
        assert!(entry.remaining_ttl().unwrap() <= Duration::from_millis(100));
    }

    #[test]
    fn test_huge_ttl_never_expires() {
        // Fits chrono::Duration but overflows the timestamp
        let entry = CacheEntry::new("a", Bytes::from("x"), Duration::from_secs(1 << 50), false);
        assert!(chrono::Duration::from_std(entry.ttl).is_ok());
        assert!(entry.expires_at().is_none());
        assert!(!entry.is_expired());
        assert!(entry.remaining_ttl().is_none());
    }

    #[test]
    fn test_stored_size() {
        let entry = CacheEntry::new("abc", Bytes::from("hello"), Duration::ZERO, false);
        assert_eq!(entry.stored_size(), 8);
    }
}
