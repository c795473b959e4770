//! Risk Cache - Multi-Tier Caching and Invalidation Engine
//!
//! Sits between the risk-scoring request handlers and the slow stores behind
//! them (feature stores, model artifacts, provider responses, session state).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        Request handlers / model serving                      │
//! └──────────────────────────────────┬──────────────────────────────────────────┘
//!                                    │ RiskCache
//! ┌──────────────────────────────────┴──────────────────────────────────────────┐
//! │                              Coordinator                                     │
//! │   data classes: cache-aside │ write-through │ write-behind │ refresh-ahead   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────────────┐  ┌─────────────────────┐  │
//! │  │   Local Tier    │  │    Distributed Tier     │  │    Invalidation     │  │
//! │  │ (LRU, lazy TTL) │  │ (consistent-hash ring)  │  │ (patterns, gens,    │  │
//! │  └─────────────────┘  └────────────┬────────────┘  │  dependencies)      │  │
//! │                                    │               └─────────────────────┘  │
//! │                       ┌────────────┴────────────┐                            │
//! │                       │  CacheNode × N          │                            │
//! │                       └─────────────────────────┘                            │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │   Scheduler (TTL sweep, warming)   │   Ops server (/healthz /metrics /stats) │
//! └─────────────────────────────────────────────────────────────────────────────┘
//!                                    │ BackingStore
//!                           authoritative data
//! ```
//!
//! # Modules
//!
//! - [`cache`]: Tiers, shard ring, invalidation, write-behind, warming
//! - [`config`]: Engine configuration
//! - [`scheduler`]: Background sweep and warming
//! - [`server`]: Ops HTTP endpoints
//! - [`domain`]: Ports for backing stores and cache nodes
//! - [`adapters`]: In-memory implementations of the ports
//! - [`error`]: Error types and handling

pub mod adapters;
pub mod cache;
pub mod config;
pub mod domain;
pub mod error;
pub mod scheduler;
pub mod server;

// Re-export commonly used types
pub use adapters::{LocalNode, MemoryStore};

pub use cache::{
    CacheEvent, CacheKey, CacheWarmer, Coordinator, DataClassConfig, InvalidationReport,
    KeyPattern, ReadResult, RiskCache, RiskCacheRef, StatsSnapshot, TierKind, WritePattern,
};

pub use config::{DistributedConfig, EngineConfig};

pub use domain::ports::{BackingStore, CacheNode, SharedBackingStore, SharedCacheNode};

pub use error::{Error, ErrorAction, Result};

pub use scheduler::Scheduler;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
