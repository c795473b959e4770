//! Error types for the cache engine
//!
//! A cache miss is not an error and never appears here; it is the
//! [`Lookup::Miss`](crate::cache::Lookup) variant. Oversized entries are not an
//! error either; they surface as [`SetOutcome::Rejected`](crate::cache::SetOutcome).

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Malformed cache key {key}: expected namespace:id")]
    InvalidKey { key: String },

    // =========================================================================
    // Backing Store Errors
    // =========================================================================
    #[error("Backing store unavailable for key {key}: {reason}")]
    BackingStoreUnavailable { key: String, reason: String },

    #[error("Backing store timed out for key {key} after {timeout_ms}ms")]
    BackingStoreTimeout { key: String, timeout_ms: u64 },

    #[error("Backing store rejected operation {operation} on {key}: {reason}")]
    BackingStoreRejected {
        key: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Codec Errors
    // =========================================================================
    #[error("Codec failure: {0}")]
    Codec(String),

    // =========================================================================
    // Invalidation Errors
    // =========================================================================
    #[error("Invalidation of {target} not acknowledged by node {node}: {reason}")]
    InvalidationPropagation {
        node: String,
        target: String,
        reason: String,
    },

    #[error("Invalid invalidation pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    // =========================================================================
    // Write-Behind Errors
    // =========================================================================
    #[error("Write-behind queue saturated, enqueue of {key} timed out after {waited_ms}ms")]
    WriteBehindSaturated { key: String, waited_ms: u64 },

    #[error("Write-behind queue is shut down")]
    WriteBehindClosed,

    // =========================================================================
    // Shard Ring Errors
    // =========================================================================
    #[error("Shard ring has no nodes")]
    EmptyRing,

    #[error("Cache node not found: {node_id}")]
    NodeNotFound { node_id: String },

    #[error("Cache node already registered: {node_id}")]
    NodeAlreadyRegistered { node_id: String },

    #[error("Cache node {node_id} unreachable: {reason}")]
    NodeUnreachable { node_id: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take when an operation fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Retry with exponential backoff
    RetryWithBackoff,
    /// Retry after a specific duration
    RetryAfter(Duration),
    /// Surface to the caller immediately
    FailFast,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::BackingStoreUnavailable { .. }
            | Error::BackingStoreTimeout { .. }
            | Error::NodeUnreachable { .. }
            | Error::InvalidationPropagation { .. } => ErrorAction::RetryWithBackoff,

            // Queue pressure - give the workers a moment
            Error::WriteBehindSaturated { .. } => {
                ErrorAction::RetryAfter(Duration::from_millis(100))
            }

            // Everything else is deterministic
            _ => ErrorAction::FailFast,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::FailFast)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackingStoreUnavailable { .. }
                | Error::BackingStoreTimeout { .. }
                | Error::NodeUnreachable { .. }
                | Error::InvalidationPropagation { .. }
        )
    }
}

/// Result type alias for the cache engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::BackingStoreTimeout {
            key: "features:acme".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.action(), ErrorAction::RetryWithBackoff);

        let err = Error::WriteBehindSaturated {
            key: "session:42".into(),
            waited_ms: 50,
        };
        assert_eq!(
            err.action(),
            ErrorAction::RetryAfter(Duration::from_millis(100))
        );

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::FailFast);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::BackingStoreUnavailable {
            key: "model:lstm".into(),
            reason: "connection refused".into(),
        };
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let codec = Error::Codec("bad frame".into());
        assert!(!codec.is_retryable());
        assert!(!codec.is_transient());
    }
}
