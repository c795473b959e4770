//! Invalidation Engine
//!
//! Four invalidation modes that may be layered on the same key:
//!
//! - **Time-based**: entries carry a TTL, enforced lazily on read by every
//!   tier and eagerly by [`InvalidationEngine::sweep_expired`].
//! - **Event-based**: [`InvalidationEngine::invalidate_key`] and
//!   [`InvalidationEngine::invalidate_pattern`] delete matching keys from
//!   every tier.
//! - **Version-based**: [`GenerationRegistry::bump`] moves a namespace to a
//!   new generation; keys built under the old one become unreachable and age
//!   out through eviction or TTL.
//! - **Dependency-based**: [`DependencyGraph`] records `dependency -> keys`
//!   edges; invalidating a dependency deletes every key that listed it.
//!
//! The local tier is always invalidated before the call returns. Remote
//! nodes are invalidated in a background task with bounded retry, or inline
//! when `blocking` is configured. While a background propagation runs, its
//! target is fenced: [`InvalidationEngine::superseded`] reports distributed
//! entries stored before the invalidation so readers skip them instead of
//! copying them back into the local tier.

use crate::cache::entry::CacheKey;
use crate::cache::events::{CacheEvent, EventBus};
use crate::cache::metrics::CacheMetrics;
use crate::cache::retry::{with_retry, RetryConfig};
use crate::cache::storage::{DistributedTier, LocalTier, TierStorage};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

// =============================================================================
// Key Patterns
// =============================================================================

/// Selects keys for event-based invalidation
///
/// Patterns are matched against the storage key and, for versioned keys,
/// against the key without its generation suffix, so `features:*` also
/// covers `features:acme:v3`.
#[derive(Debug, Clone)]
pub enum KeyPattern {
    Exact(String),
    Prefix(String),
    Glob { source: String, pattern: glob::Pattern },
}

impl KeyPattern {
    pub fn exact(key: impl Into<String>) -> Self {
        KeyPattern::Exact(key.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        KeyPattern::Prefix(prefix.into())
    }

    pub fn glob(source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let pattern = glob::Pattern::new(&source).map_err(|e| Error::InvalidPattern {
            pattern: source.clone(),
            reason: e.to_string(),
        })?;
        Ok(KeyPattern::Glob { source, pattern })
    }

    /// Pick the cheapest representation: no wildcard is exact, a single
    /// trailing `*` is a prefix, anything else is a glob
    pub fn parse(source: &str) -> Result<Self> {
        const META: &[char] = &['*', '?', '['];
        if source.is_empty() {
            return Err(Error::InvalidPattern {
                pattern: source.to_string(),
                reason: "empty pattern".to_string(),
            });
        }
        if !source.contains(META) {
            return Ok(KeyPattern::exact(source));
        }
        match source.strip_suffix('*') {
            Some(prefix) if !prefix.contains(META) => Ok(KeyPattern::prefix(prefix)),
            _ => KeyPattern::glob(source),
        }
    }

    /// Check a storage key
    pub fn matches(&self, key: &str) -> bool {
        self.matches_raw(key) || strip_generation(key).is_some_and(|logical| self.matches_raw(logical))
    }

    fn matches_raw(&self, key: &str) -> bool {
        match self {
            KeyPattern::Exact(k) => k == key,
            KeyPattern::Prefix(p) => key.starts_with(p.as_str()),
            KeyPattern::Glob { pattern, .. } => pattern.matches(key),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            KeyPattern::Exact(k) => k,
            KeyPattern::Prefix(p) => p,
            KeyPattern::Glob { source, .. } => source,
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Prefix(p) => write!(f, "{}*", p),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// `ns:id:v7` -> `ns:id`
fn strip_generation(key: &str) -> Option<&str> {
    let (rest, last) = key.rsplit_once(':')?;
    let digits = last.strip_prefix('v')?;
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        Some(rest)
    } else {
        None
    }
}

// =============================================================================
// Generation Registry
// =============================================================================

/// Per-namespace generation tags
#[derive(Debug, Default)]
pub struct GenerationRegistry {
    tags: DashMap<String, AtomicU64>,
}

impl GenerationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation of a namespace (0 until first bumped)
    pub fn current(&self, namespace: &str) -> u64 {
        self.tags
            .get(namespace)
            .map(|g| g.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Move a namespace to its next generation
    pub fn bump(&self, namespace: &str) -> u64 {
        if let Some(tag) = self.tags.get(namespace) {
            return tag.fetch_add(1, Ordering::AcqRel) + 1;
        }
        self.tags
            .entry(namespace.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::AcqRel)
            + 1
    }

    /// Key under the namespace's current generation
    pub fn versioned_key(&self, namespace: &str, id: &str) -> CacheKey {
        CacheKey::versioned(namespace, id, self.current(namespace))
    }

    /// Bind a key to its namespace's current generation
    pub fn resolve(&self, key: &CacheKey) -> CacheKey {
        key.at_generation(self.current(&key.namespace))
    }

    /// All namespaces that were ever bumped
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.tags
            .iter()
            .map(|e| (e.key().clone(), e.value().load(Ordering::Acquire)))
            .collect()
    }
}

// =============================================================================
// Dependency Graph
// =============================================================================

#[derive(Debug)]
struct Dependent {
    /// Dependencies the key listed
    on: HashSet<String>,
    /// Namespace and generation of a versioned key
    scope: Option<(String, u64)>,
    /// Changes whenever the key's edges are recorded again
    stamp: u64,
}

#[derive(Debug, Default)]
struct Edges {
    /// dependency -> keys that depend on it
    dependents: HashMap<String, HashSet<String>>,
    /// key -> what it depends on
    keys: HashMap<String, Dependent>,
    next_stamp: u64,
}

impl Edges {
    fn unlink_dependent(&mut self, key: &str) {
        if let Some(dependent) = self.keys.remove(key) {
            for dep in dependent.on {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(key);
                    if set.is_empty() {
                        self.dependents.remove(&dep);
                    }
                }
            }
        }
    }
}

/// Many-to-many `dependency -> dependent key` edges
///
/// Edges of a key are dropped when the key is deleted or invalidated, when
/// its namespace moves past the key's generation, and by
/// [`InvalidationEngine::sweep_expired`] once no tier holds the key. A
/// dependency disappears once it has no dependents left.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: Mutex<Edges>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dependencies of a key, replacing any it had before
    pub fn record(&self, key: &str, dependencies: &[String]) {
        self.record_scoped(key, None, dependencies);
    }

    /// [`record`](Self::record) for a key bound to a generation
    pub fn record_versioned(&self, key: &CacheKey, dependencies: &[String]) {
        let scope = key.generation.map(|g| (key.namespace.clone(), g));
        self.record_scoped(&key.to_storage_key(), scope, dependencies);
    }

    fn record_scoped(&self, key: &str, scope: Option<(String, u64)>, dependencies: &[String]) {
        let mut edges = self.edges.lock();
        edges.unlink_dependent(key);
        if dependencies.is_empty() {
            return;
        }
        for dep in dependencies {
            edges
                .dependents
                .entry(dep.clone())
                .or_default()
                .insert(key.to_string());
        }
        edges.next_stamp += 1;
        let stamp = edges.next_stamp;
        edges.keys.insert(
            key.to_string(),
            Dependent {
                on: dependencies.iter().cloned().collect(),
                scope,
                stamp,
            },
        );
    }

    /// Remove a dependency and return every key that depended on it
    ///
    /// The returned keys lose all of their edges.
    pub fn take_dependents(&self, dependency: &str) -> Vec<String> {
        let mut edges = self.edges.lock();
        let Some(dependents) = edges.dependents.remove(dependency) else {
            return Vec::new();
        };
        let mut keys: Vec<String> = dependents.into_iter().collect();
        for key in &keys {
            edges.unlink_dependent(key);
        }
        keys.sort();
        keys
    }

    /// Drop every edge touching a deleted key
    pub fn forget(&self, key: &str) {
        let mut edges = self.edges.lock();
        edges.unlink_dependent(key);
        if let Some(dependents) = edges.dependents.remove(key) {
            for dependent in dependents {
                if let Some(entry) = edges.keys.get_mut(&dependent) {
                    entry.on.remove(key);
                    if entry.on.is_empty() {
                        edges.keys.remove(&dependent);
                    }
                }
            }
        }
    }

    /// Drop the edges of keys built under a namespace generation older than
    /// `generation`, returning how many keys lost their edges
    pub fn forget_generations_before(&self, namespace: &str, generation: u64) -> usize {
        let mut edges = self.edges.lock();
        let orphaned: Vec<String> = edges
            .keys
            .iter()
            .filter(|(_, d)| {
                d.scope
                    .as_ref()
                    .is_some_and(|(ns, g)| ns == namespace && *g < generation)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &orphaned {
            edges.unlink_dependent(key);
        }
        orphaned.len()
    }

    /// Keys with recorded dependencies, each with its current stamp
    pub fn tracked(&self) -> Vec<(String, u64)> {
        self.edges
            .lock()
            .keys
            .iter()
            .map(|(k, d)| (k.clone(), d.stamp))
            .collect()
    }

    /// Drop a key's edges unless they were recorded again after `stamp`
    pub fn forget_if_unchanged(&self, key: &str, stamp: u64) -> bool {
        let mut edges = self.edges.lock();
        if edges.keys.get(key).map(|d| d.stamp) != Some(stamp) {
            return false;
        }
        edges.unlink_dependent(key);
        true
    }

    /// Keys currently depending on a dependency
    pub fn dependents_of(&self, dependency: &str) -> Vec<String> {
        let edges = self.edges.lock();
        let mut keys: Vec<String> = edges
            .dependents
            .get(dependency)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Number of edges
    pub fn edge_count(&self) -> usize {
        self.edges.lock().dependents.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.lock().dependents.is_empty()
    }
}

// =============================================================================
// Invalidation Engine
// =============================================================================

/// Invalidation settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Wait for every node to acknowledge before returning
    pub blocking: bool,
    /// Retry policy for remote propagation
    pub retry: RetryConfig,
}

/// State of the remote half of an invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Propagation {
    /// Every node acknowledged (blocking mode)
    Acknowledged { removed: usize },
    /// Running in the background
    Pending,
    /// Distributed tier has no nodes
    Skipped,
}

/// Outcome of an invalidation call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationReport {
    pub target: String,
    /// Keys removed from the local tier
    pub local_removed: usize,
    pub remote: Propagation,
}

/// Expired entries removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub local: usize,
    pub distributed: usize,
    /// Keys whose dependency edges were dropped because no tier holds them
    pub edges_pruned: usize,
}

#[derive(Debug, Clone)]
enum RemoteOp {
    Keys(Vec<String>),
    Pattern(KeyPattern),
}

impl RemoteOp {
    fn covers(&self, key: &str) -> bool {
        match self {
            RemoteOp::Keys(keys) => keys.iter().any(|k| k == key),
            RemoteOp::Pattern(pattern) => pattern.matches(key),
        }
    }
}

/// Target of a propagation still running, with the time it was issued
#[derive(Debug)]
struct Fence {
    op: RemoteOp,
    issued_at: DateTime<Utc>,
}

/// Coordinates invalidation across both tiers
pub struct InvalidationEngine {
    local: Arc<LocalTier>,
    distributed: Arc<DistributedTier>,
    generations: GenerationRegistry,
    dependencies: DependencyGraph,
    config: InvalidationConfig,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
    in_flight: Arc<AtomicUsize>,
    drained: Arc<Notify>,
    fences: Arc<Mutex<HashMap<u64, Fence>>>,
    next_fence: AtomicU64,
}

impl InvalidationEngine {
    pub fn new(
        local: Arc<LocalTier>,
        distributed: Arc<DistributedTier>,
        config: InvalidationConfig,
        metrics: Arc<CacheMetrics>,
        events: EventBus,
    ) -> Self {
        Self {
            local,
            distributed,
            generations: GenerationRegistry::new(),
            dependencies: DependencyGraph::new(),
            config,
            metrics,
            events,
            in_flight: Arc::new(AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
            fences: Arc::new(Mutex::new(HashMap::new())),
            next_fence: AtomicU64::new(0),
        }
    }

    pub fn generations(&self) -> &GenerationRegistry {
        &self.generations
    }

    pub fn dependencies(&self) -> &DependencyGraph {
        &self.dependencies
    }

    /// Remote propagations still running
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether a distributed entry stored at `stored_at` predates an
    /// invalidation of `key` whose propagation has not finished
    pub fn superseded(&self, key: &str, stored_at: DateTime<Utc>) -> bool {
        if self.in_flight.load(Ordering::Acquire) == 0 {
            return false;
        }
        self.fences
            .lock()
            .values()
            .any(|fence| stored_at <= fence.issued_at && fence.op.covers(key))
    }

    /// Delete one storage key from every tier
    pub async fn invalidate_key(&self, key: &str) -> Result<InvalidationReport> {
        self.invalidate_keys(key, vec![key.to_string()]).await
    }

    /// Delete every key matching a pattern from every tier
    pub async fn invalidate_pattern(&self, pattern: &KeyPattern) -> Result<InvalidationReport> {
        let removed = self.local.delete_matching(pattern).await?;
        for key in &removed {
            self.dependencies.forget(key);
        }
        let target = pattern.to_string();
        let remote = self
            .dispatch(&target, RemoteOp::Pattern(pattern.clone()))
            .await?;
        Ok(self.finish(target, removed.len(), remote))
    }

    /// Orphan every key of a namespace built before this call
    pub fn bump_generation(&self, namespace: &str) -> u64 {
        let generation = self.generations.bump(namespace);
        let orphaned = self
            .dependencies
            .forget_generations_before(namespace, generation);
        if orphaned > 0 {
            debug!(namespace = %namespace, orphaned, "Dropped dependency edges of older generations");
        }
        self.metrics
            .invalidation
            .generation_bumps
            .fetch_add(1, Ordering::Relaxed);
        info!(namespace = %namespace, generation, "Generation bumped");
        self.events.publish(CacheEvent::GenerationBumped {
            namespace: namespace.to_string(),
            generation,
        });
        generation
    }

    /// Record the dependencies of a stored key
    pub fn record_dependencies(&self, key: &str, dependencies: &[String]) {
        self.dependencies.record(key, dependencies);
    }

    /// Record the dependencies of a key bound to its namespace generation
    pub fn record_versioned_dependencies(&self, key: &CacheKey, dependencies: &[String]) {
        self.dependencies.record_versioned(key, dependencies);
    }

    /// Drop the dependency edges of a deleted key
    pub fn forget(&self, key: &str) {
        self.dependencies.forget(key);
    }

    /// Delete every key that listed `dependency`
    pub async fn invalidate_dependency(&self, dependency: &str) -> Result<InvalidationReport> {
        let dependents = self.dependencies.take_dependents(dependency);
        self.metrics
            .invalidation
            .dependency_cascades
            .fetch_add(1, Ordering::Relaxed);
        debug!(dependency = %dependency, dependents = dependents.len(), "Cascading dependency invalidation");
        self.invalidate_keys(dependency, dependents).await
    }

    /// Remove expired entries from both tiers, then drop the dependency
    /// edges of keys neither tier holds any more
    pub async fn sweep_expired(&self) -> SweepReport {
        let local = self.local.sweep_expired().await.unwrap_or_else(|e| {
            warn!(error = %e, "Local TTL sweep failed");
            0
        });
        let distributed = if self.distributed.router().is_empty() {
            0
        } else {
            self.distributed.sweep_expired().await.unwrap_or_else(|e| {
                warn!(error = %e, "Distributed TTL sweep incomplete");
                0
            })
        };
        self.metrics
            .invalidation
            .swept
            .fetch_add((local + distributed) as u64, Ordering::Relaxed);
        let edges_pruned = self.prune_dependencies().await;
        if local + distributed + edges_pruned > 0 {
            debug!(local, distributed, edges_pruned, "TTL sweep removed expired entries");
        }
        SweepReport {
            local,
            distributed,
            edges_pruned,
        }
    }

    /// Forget edges of keys that were evicted, expired or orphaned
    ///
    /// A key still cached on either tier keeps its edges so a dependency
    /// invalidation can reach it. Unreachable nodes count as holding the key.
    async fn prune_dependencies(&self) -> usize {
        let has_nodes = !self.distributed.router().is_empty();
        let mut pruned = 0;
        for (key, stamp) in self.dependencies.tracked() {
            if self.local.store().peek(&key).is_some() {
                continue;
            }
            if has_nodes {
                match self.distributed.contains(&key).await {
                    Ok(false) => {}
                    Ok(true) => continue,
                    Err(e) => {
                        debug!(key = %key, error = %e, "Keeping dependency edges, distributed tier unavailable");
                        continue;
                    }
                }
            }
            if self.dependencies.forget_if_unchanged(&key, stamp) {
                pruned += 1;
            }
        }
        pruned
    }

    /// Wait for background propagations, up to `timeout`
    ///
    /// Returns false if some were still running at the deadline.
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    async fn invalidate_keys(&self, target: &str, keys: Vec<String>) -> Result<InvalidationReport> {
        let mut local_removed = 0;
        for key in &keys {
            if self.local.delete(key).await? {
                local_removed += 1;
            }
            self.dependencies.forget(key);
        }
        let remote = if keys.is_empty() {
            Propagation::Acknowledged { removed: 0 }
        } else {
            self.dispatch(target, RemoteOp::Keys(keys)).await?
        };
        Ok(self.finish(target.to_string(), local_removed, remote))
    }

    fn finish(&self, target: String, local_removed: usize, remote: Propagation) -> InvalidationReport {
        let inv = &self.metrics.invalidation;
        inv.invalidations.fetch_add(1, Ordering::Relaxed);
        inv.keys_invalidated
            .fetch_add(local_removed as u64, Ordering::Relaxed);
        debug!(target = %target, local_removed, remote = ?remote, "Invalidated");
        self.events.publish(CacheEvent::Invalidated {
            target: target.clone(),
            keys_removed: local_removed,
        });
        InvalidationReport {
            target,
            local_removed,
            remote,
        }
    }

    async fn dispatch(&self, target: &str, op: RemoteOp) -> Result<Propagation> {
        if self.distributed.router().is_empty() {
            return Ok(Propagation::Skipped);
        }

        let fence_op = op.clone();
        let task = propagate(
            Arc::clone(&self.distributed),
            op,
            target.to_string(),
            self.config.retry.clone(),
            Arc::clone(&self.metrics),
            self.events.clone(),
        );

        if self.config.blocking {
            let removed = task.await?;
            return Ok(Propagation::Acknowledged { removed });
        }

        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let fence_id = self.next_fence.fetch_add(1, Ordering::Relaxed);
        self.fences.lock().insert(
            fence_id,
            Fence {
                op: fence_op,
                issued_at: Utc::now(),
            },
        );
        let in_flight = Arc::clone(&self.in_flight);
        let drained = Arc::clone(&self.drained);
        let fences = Arc::clone(&self.fences);
        tokio::spawn(async move {
            // Failures are logged and counted inside
            let _ = task.await;
            fences.lock().remove(&fence_id);
            if in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                drained.notify_waiters();
            }
        });
        Ok(Propagation::Pending)
    }
}

/// Apply an invalidation to the distributed tier with retry
///
/// Every target is attempted; the first failure is returned after all of
/// them have been tried.
async fn propagate(
    distributed: Arc<DistributedTier>,
    op: RemoteOp,
    target: String,
    retry: RetryConfig,
    metrics: Arc<CacheMetrics>,
    events: EventBus,
) -> Result<usize> {
    let mut removed = 0;
    let mut failures: Vec<(String, Error)> = Vec::new();

    match &op {
        RemoteOp::Keys(keys) => {
            for key in keys {
                let result = with_retry(&retry, "invalidate_key", || distributed.delete(key)).await;
                match result {
                    Ok(true) => removed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        let node = distributed
                            .router()
                            .route_id(key)
                            .unwrap_or_else(|_| "unknown".to_string());
                        failures.push((node, e));
                    }
                }
            }
        }
        RemoteOp::Pattern(pattern) => {
            for node in distributed.router().all_nodes() {
                let result =
                    with_retry(&retry, "invalidate_pattern", || node.delete_matching(pattern)).await;
                match result {
                    Ok(keys) => removed += keys.len(),
                    Err(e) => failures.push((node.id().to_string(), e)),
                }
            }
        }
    }

    let mut first: Option<Error> = None;
    for (node, e) in failures {
        metrics
            .invalidation
            .propagation_failures
            .fetch_add(1, Ordering::Relaxed);
        warn!(node_id = %node, target = %target, error = %e, "Invalidation not acknowledged");
        events.publish(CacheEvent::PropagationFailed {
            node_id: node.clone(),
            target: target.clone(),
            error: e.to_string(),
        });
        first.get_or_insert(Error::InvalidationPropagation {
            node,
            target: target.clone(),
            reason: e.to_string(),
        });
    }

    match first {
        Some(e) => Err(e),
        None => Ok(removed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::LocalNode;
    use crate::cache::codec::Codec;
    use crate::cache::shard::{ShardRouter, DEFAULT_REPLICAS};
    use crate::cache::storage::Lookup;
    use crate::cache::tier::TierConfig;
    use crate::domain::ports::SharedCacheNode;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    struct Fixture {
        engine: InvalidationEngine,
        local: Arc<LocalTier>,
        distributed: Arc<DistributedTier>,
        nodes: Vec<Arc<LocalNode>>,
        metrics: Arc<CacheMetrics>,
    }

    fn fixture(blocking: bool) -> Fixture {
        let metrics = Arc::new(CacheMetrics::new());
        let events = EventBus::default();
        let nodes: Vec<Arc<LocalNode>> = ["n1", "n2"]
            .iter()
            .map(|id| Arc::new(LocalNode::new(*id, TierConfig::with_max_entries(100))))
            .collect();
        let shared: Vec<SharedCacheNode> = nodes.iter().map(|n| Arc::clone(n) as SharedCacheNode).collect();
        let router = Arc::new(ShardRouter::with_nodes(DEFAULT_REPLICAS, shared, events.clone()));
        let local = Arc::new(LocalTier::with_observers(
            TierConfig::with_max_entries(100),
            Codec::default(),
            Arc::clone(&metrics),
            events.clone(),
        ));
        let distributed = Arc::new(DistributedTier::new(
            router,
            Codec::default(),
            Arc::clone(&metrics),
            events.clone(),
        ));
        let config = InvalidationConfig {
            blocking,
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
                multiplier: 2.0,
            },
        };
        let engine = InvalidationEngine::new(
            Arc::clone(&local),
            Arc::clone(&distributed),
            config,
            Arc::clone(&metrics),
            events,
        );
        Fixture {
            engine,
            local,
            distributed,
            nodes,
            metrics,
        }
    }

    async fn put_both(f: &Fixture, key: &str) {
        f.local.set(key, Bytes::from("v"), Duration::ZERO).await.unwrap();
        f.distributed
            .set(key, Bytes::from("v"), Duration::ZERO)
            .await
            .unwrap();
    }

    #[test]
    fn test_pattern_parsing() {
        assert_matches!(KeyPattern::parse("session:42").unwrap(), KeyPattern::Exact(_));
        assert_matches!(KeyPattern::parse("session:*").unwrap(), KeyPattern::Prefix(p) if p == "session:");
        assert_matches!(KeyPattern::parse("model:*:acme").unwrap(), KeyPattern::Glob { .. });
        assert!(KeyPattern::parse("").is_err());
        assert!(KeyPattern::parse("bad[").is_err());
    }

    #[test]
    fn test_pattern_matching_ignores_generation_suffix() {
        let exact = KeyPattern::exact("features:acme");
        assert!(exact.matches("features:acme"));
        assert!(exact.matches("features:acme:v3"));
        assert!(!exact.matches("features:acme2"));

        let glob = KeyPattern::glob("model:*:acme").unwrap();
        assert!(glob.matches("model:lstm:acme:v2"));
        assert!(!glob.matches("model:lstm:other"));

        assert_eq!(KeyPattern::prefix("session:").to_string(), "session:*");
    }

    #[test]
    fn test_generation_bump() {
        let registry = GenerationRegistry::new();
        let before = registry.versioned_key("model:lstm", "acme");
        assert_eq!(before.to_storage_key(), "model:lstm:acme:v0");

        assert_eq!(registry.bump("model:lstm"), 1);
        assert_eq!(registry.bump("model:lstm"), 2);
        assert_eq!(registry.current("session"), 0);
        assert_ne!(registry.versioned_key("model:lstm", "acme"), before);
        assert_eq!(registry.snapshot().get("model:lstm"), Some(&2));
    }

    #[test]
    fn test_dependency_graph_gc() {
        let graph = DependencyGraph::new();
        graph.record("a", &["d".to_string(), "e".to_string()]);
        graph.record("b", &["d".to_string()]);
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.dependents_of("d"), vec!["a", "b"]);

        assert_eq!(graph.take_dependents("d"), vec!["a", "b"]);
        // "a" was invalidated, so its edge under "e" is gone too
        assert!(graph.is_empty());

        graph.record("c", &["x".to_string()]);
        graph.forget("c");
        assert!(graph.is_empty());

        graph.record("k", &["old".to_string()]);
        graph.record("k", &["new".to_string()]);
        assert!(graph.dependents_of("old").is_empty());
        assert_eq!(graph.dependents_of("new"), vec!["k"]);
    }

    #[test]
    fn test_dependency_graph_generation_and_stamps() {
        let graph = DependencyGraph::new();
        let deps = vec!["features:acme".to_string()];
        graph.record_versioned(&CacheKey::versioned("model:lstm", "a", 0), &deps);
        graph.record_versioned(&CacheKey::versioned("model:lstm", "b", 1), &deps);
        graph.record_versioned(&CacheKey::versioned("model", "c", 0), &deps);

        assert_eq!(graph.forget_generations_before("model:lstm", 1), 1);
        assert_eq!(
            graph.dependents_of("features:acme"),
            vec!["model:c:v0", "model:lstm:b:v1"]
        );

        let stamp_of = |key: &str| {
            graph
                .tracked()
                .into_iter()
                .find(|(k, _)| k == key)
                .map(|(_, stamp)| stamp)
                .unwrap()
        };
        let stale = stamp_of("model:c:v0");
        graph.record("model:c:v0", &deps);
        assert!(!graph.forget_if_unchanged("model:c:v0", stale));
        let current = stamp_of("model:c:v0");
        assert!(graph.forget_if_unchanged("model:c:v0", current));
        assert_eq!(graph.edge_count(), 1);
    }

    #[tokio::test]
    async fn test_pending_propagation_fences_older_entries() {
        let f = fixture(false);
        put_both(&f, "features:acme:v0").await;
        let before = Utc::now();

        let report = f
            .engine
            .invalidate_pattern(&KeyPattern::prefix("features:"))
            .await
            .unwrap();
        assert_eq!(report.remote, Propagation::Pending);
        assert!(f.engine.superseded("features:acme:v0", before));
        assert!(!f.engine.superseded("session:1", before));
        assert!(!f
            .engine
            .superseded("features:acme:v0", Utc::now() + chrono::Duration::seconds(1)));

        assert!(f.engine.drain(Duration::from_secs(5)).await);
        assert!(!f.engine.superseded("features:acme:v0", before));
        assert_matches!(f.distributed.get("features:acme:v0").await.unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn test_sweep_keeps_edges_of_cached_keys() {
        let f = fixture(true);
        put_both(&f, "score:live").await;
        f.engine.record_dependencies("score:live", &["features:d".to_string()]);
        f.engine.record_dependencies("score:gone", &["features:d".to_string()]);
        // Evicted locally but still on a node
        f.distributed
            .set("score:remote", Bytes::from("v"), Duration::ZERO)
            .await
            .unwrap();
        f.engine.record_dependencies("score:remote", &["features:d".to_string()]);

        let report = f.engine.sweep_expired().await;
        assert_eq!(report.edges_pruned, 1);
        assert_eq!(
            f.engine.dependencies().dependents_of("features:d"),
            vec!["score:live", "score:remote"]
        );
    }

    #[tokio::test]
    async fn test_blocking_pattern_invalidation_hits_every_tier() {
        let f = fixture(true);
        for i in 0..20 {
            put_both(&f, &format!("session:{}", i)).await;
        }
        put_both(&f, "features:keep").await;

        let report = f
            .engine
            .invalidate_pattern(&KeyPattern::parse("session:*").unwrap())
            .await
            .unwrap();
        assert_eq!(report.local_removed, 20);
        assert_eq!(report.remote, Propagation::Acknowledged { removed: 20 });
        assert_eq!(f.local.keys().await.unwrap(), vec!["features:keep"]);
        assert_eq!(f.distributed.keys().await.unwrap(), vec!["features:keep"]);
    }

    #[tokio::test]
    async fn test_dependency_cascade() {
        let f = fixture(true);
        put_both(&f, "score:a").await;
        put_both(&f, "score:b").await;
        f.engine.record_dependencies("score:a", &["features:d".to_string()]);
        f.engine.record_dependencies("score:b", &["features:d".to_string()]);

        let report = f.engine.invalidate_dependency("features:d").await.unwrap();
        assert_eq!(report.local_removed, 2);
        assert_matches!(f.local.get("score:a").await.unwrap(), Lookup::Miss);
        assert_matches!(f.distributed.get("score:b").await.unwrap(), Lookup::Miss);
        assert!(f.engine.dependencies().is_empty());
    }

    #[tokio::test]
    async fn test_async_propagation_failure_keeps_local_correct() {
        let f = fixture(false);
        put_both(&f, "features:acme").await;
        for node in &f.nodes {
            node.set_available(false);
        }

        let report = f.engine.invalidate_key("features:acme").await.unwrap();
        assert_eq!(report.local_removed, 1);
        assert_eq!(report.remote, Propagation::Pending);
        assert_matches!(f.local.get("features:acme").await.unwrap(), Lookup::Miss);

        assert!(f.engine.drain(Duration::from_secs(5)).await);
        assert_eq!(
            f.metrics
                .invalidation
                .propagation_failures
                .load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_blocking_propagation_failure_is_reported() {
        let f = fixture(true);
        put_both(&f, "features:acme").await;
        for node in &f.nodes {
            node.set_available(false);
        }

        let result = f
            .engine
            .invalidate_pattern(&KeyPattern::prefix("features:"))
            .await;
        assert_matches!(result, Err(Error::InvalidationPropagation { .. }));
        assert_matches!(f.local.get("features:acme").await.unwrap(), Lookup::Miss);
    }

    #[tokio::test]
    async fn test_sweep_expired() {
        let f = fixture(true);
        f.local
            .set("session:old", Bytes::from("v"), Duration::from_millis(10))
            .await
            .unwrap();
        f.distributed
            .set("session:old", Bytes::from("v"), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let report = f.engine.sweep_expired().await;
        assert_eq!(
            report,
            SweepReport {
                local: 1,
                distributed: 1,
                edges_pruned: 0
            }
        );
    }
}
