//! Engine Configuration
//!
//! Read once at process start from YAML (or JSON). Every field has a default,
//! so an empty document yields a working single-process engine.
//!
//! ```yaml
//! local:
//!   capacity_bytes: 268435456
//!   max_entries: 100000
//! distributed:
//!   nodes: [cache-0, cache-1, cache-2]
//!   replicas: 160
//! data_classes:
//!   session:
//!     pattern: write-through
//!     ttl_ms: 1800000
//!   features:
//!     pattern: refresh-ahead
//!     ttl_ms: 300000
//!     refresh_window_ms: 30000
//! ```

use crate::cache::codec::CodecConfig;
use crate::cache::coordinator::{DataClassConfig, WritePattern};
use crate::cache::invalidation::InvalidationConfig;
use crate::cache::retry::RetryConfig;
use crate::cache::shard::DEFAULT_REPLICAS;
use crate::cache::tier::TierConfig;
use crate::cache::warmer::WarmerConfig;
use crate::cache::write_behind::WriteBehindConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Distributed tier layout
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    /// Node identifiers placed on the ring at startup
    pub nodes: Vec<String>,
    /// Virtual replicas per node
    pub replicas: usize,
    /// Capacity of each in-process node
    pub node_capacity: TierConfig,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["cache-0".to_string()],
            replicas: DEFAULT_REPLICAS,
            node_capacity: TierConfig::node_default(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Process-local tier capacity
    pub local: TierConfig,
    pub distributed: DistributedConfig,
    pub codec: CodecConfig,
    pub invalidation: InvalidationConfig,
    /// Retry policy for backing-store calls
    pub retry: RetryConfig,
    /// Bound on each backing-store attempt
    pub load_timeout_ms: u64,
    pub write_behind: WriteBehindConfig,
    /// Data class per namespace; a namespace without an entry falls back to
    /// its parent (`model:lstm` -> `model`) and then to `default_class`
    pub data_classes: BTreeMap<String, DataClassConfig>,
    pub default_class: DataClassConfig,
    pub warmer: WarmerConfig,
    /// Seconds between TTL sweeps
    pub sweep_interval_secs: u64,
    /// Capacity of the cache event broadcast channel
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local: TierConfig::local_default(),
            distributed: DistributedConfig::default(),
            codec: CodecConfig::default(),
            invalidation: InvalidationConfig::default(),
            retry: RetryConfig::default(),
            load_timeout_ms: 250,
            write_behind: WriteBehindConfig::default(),
            data_classes: BTreeMap::new(),
            default_class: DataClassConfig::default(),
            warmer: WarmerConfig::default(),
            sweep_interval_secs: 30,
            event_channel_capacity: 1024,
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as YAML
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    /// Data class governing a namespace
    pub fn class_for(&self, namespace: &str) -> &DataClassConfig {
        let mut current = namespace;
        loop {
            if let Some(class) = self.data_classes.get(current) {
                return class;
            }
            match current.rsplit_once(':') {
                Some((parent, _)) => current = parent,
                None => return &self.default_class,
            }
        }
    }

    pub fn load_timeout(&self) -> Duration {
        Duration::from_millis(self.load_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.distributed.replicas == 0 {
            return Err(invalid("distributed.replicas must be at least 1"));
        }
        let mut seen = HashSet::new();
        for node in &self.distributed.nodes {
            if node.is_empty() {
                return Err(invalid("distributed.nodes contains an empty id"));
            }
            if !seen.insert(node.as_str()) {
                return Err(invalid(format!("distributed.nodes lists {} twice", node)));
            }
        }
        if self.load_timeout_ms == 0 {
            return Err(invalid("load_timeout_ms must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be at least 1"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(invalid("retry.multiplier must be at least 1.0"));
        }
        if self.write_behind.workers == 0 || self.write_behind.queue_capacity == 0 {
            return Err(invalid("write_behind needs at least one worker and a non-empty queue"));
        }
        if self.sweep_interval_secs == 0 {
            return Err(invalid("sweep_interval_secs must be positive"));
        }
        if self.event_channel_capacity == 0 {
            return Err(invalid("event_channel_capacity must be positive"));
        }
        if self.warmer.enabled && self.warmer.interval_secs == 0 {
            return Err(invalid("warmer.interval_secs must be positive when warming is enabled"));
        }
        if let Some(predictive) = &self.warmer.predictive {
            if !(0.0..=1.0).contains(&predictive.threshold) {
                return Err(invalid("warmer.predictive.threshold must be within 0.0..=1.0"));
            }
        }

        let classes = self
            .data_classes
            .iter()
            .map(|(ns, c)| (ns.as_str(), c))
            .chain(std::iter::once(("default_class", &self.default_class)));
        for (namespace, class) in classes {
            if class.pattern == WritePattern::RefreshAhead {
                if class.ttl_ms == 0 {
                    return Err(invalid(format!(
                        "{}: refresh-ahead needs a TTL to refresh ahead of",
                        namespace
                    )));
                }
                if class.refresh_window_ms >= class.ttl_ms {
                    return Err(invalid(format!(
                        "{}: refresh_window_ms must be shorter than ttl_ms",
                        namespace
                    )));
                }
            }
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Configuration(message.into())
}
