//! Shard Router
//!
//! Consistent hashing with virtual replicas. Each node is placed on a 64-bit
//! ring `replicas` times; a key belongs to the first replica at or after its
//! hash, wrapping around at the end of the ring.
//!
//! # Snapshots and rebalance
//!
//! The ring is immutable. A rebalance builds a new ring and publishes it with
//! a single pointer swap, so a reader sees either the old or the new ring and
//! never a partial one. The published [`RingSnapshot`] keeps the ring it
//! replaced until data migration finishes; during that window a miss on the
//! new owner falls back to the previous owner.
//!
//! Rebalances are serialized: a second `add_node`/`remove_node` waits until
//! the previous migration has completed.

use crate::cache::events::{CacheEvent, EventBus};
use crate::cache::metrics::ShardStats;
use crate::cache::storage::StoreRead;
use crate::domain::ports::SharedCacheNode;
use crate::error::{Error, Result};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default virtual replicas per node
pub const DEFAULT_REPLICAS: usize = 160;

/// Position of a key on the ring
pub fn hash_key(key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

// =============================================================================
// Hash Ring
// =============================================================================

/// Immutable consistent-hash ring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashRing {
    replicas: usize,
    positions: BTreeMap<u64, String>,
    nodes: BTreeSet<String>,
}

impl HashRing {
    /// Empty ring
    pub fn new(replicas: usize) -> Self {
        Self::build(replicas, BTreeSet::new())
    }

    /// Ring over the given nodes
    pub fn with_nodes<I, S>(replicas: usize, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::build(replicas, nodes.into_iter().map(Into::into).collect())
    }

    /// Copy of this ring with one more node
    pub fn with_node(&self, node_id: &str) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.insert(node_id.to_string());
        Self::build(self.replicas, nodes)
    }

    /// Copy of this ring without a node
    pub fn without_node(&self, node_id: &str) -> Self {
        let mut nodes = self.nodes.clone();
        nodes.remove(node_id);
        Self::build(self.replicas, nodes)
    }

    /// Positions depend only on the node set, never on insertion history.
    /// On a hash collision the node that sorts first keeps the position.
    fn build(replicas: usize, nodes: BTreeSet<String>) -> Self {
        let replicas = replicas.max(1);
        let mut positions = BTreeMap::new();
        for node in &nodes {
            for replica in 0..replicas {
                positions
                    .entry(hash_key(&format!("{}#{}", node, replica)))
                    .or_insert_with(|| node.clone());
            }
        }
        Self {
            replicas,
            positions,
            nodes,
        }
    }

    /// Owner of a key
    pub fn route(&self, key: &str) -> Option<&str> {
        let h = hash_key(key);
        self.positions
            .range(h..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, node)| node.as_str())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    /// Node ids in sorted order
    pub fn node_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.nodes.iter().map(String::as_str)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn replicas(&self) -> usize {
        self.replicas
    }

    /// Number of occupied ring positions
    pub fn positions(&self) -> usize {
        self.positions.len()
    }
}

// =============================================================================
// Ring Snapshot
// =============================================================================

/// What readers see: the live ring plus, during migration, the one it replaced
#[derive(Debug, Clone)]
pub struct RingSnapshot {
    /// Increments on every published change
    pub epoch: u64,
    pub current: Arc<HashRing>,
    pub previous: Option<Arc<HashRing>>,
}

impl RingSnapshot {
    /// Owner on the live ring
    pub fn owner(&self, key: &str) -> Option<&str> {
        self.current.route(key)
    }

    /// Owner on the previous ring, if a migration is running and it differs
    pub fn previous_owner(&self, key: &str) -> Option<&str> {
        let previous = self.previous.as_ref()?.route(key)?;
        match self.current.route(key) {
            Some(owner) if owner == previous => None,
            _ => Some(previous),
        }
    }

    pub fn is_migrating(&self) -> bool {
        self.previous.is_some()
    }
}

// =============================================================================
// Migration
// =============================================================================

/// Outcome of moving data after a rebalance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    /// Ring epoch the migration converged to
    pub epoch: u64,
    pub keys_examined: usize,
    pub keys_moved: usize,
    pub keys_failed: usize,
    pub duration_ms: u64,
}

/// Handle to a running migration
#[derive(Debug)]
pub struct MigrationHandle {
    epoch: u64,
    join: JoinHandle<MigrationReport>,
}

impl MigrationHandle {
    /// Epoch of the ring that was published
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the migration to finish
    pub async fn wait(self) -> Result<MigrationReport> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("migration task failed: {}", e)))
    }
}

// =============================================================================
// Shard Router
// =============================================================================

/// Routes keys to distributed cache nodes
pub struct ShardRouter {
    replicas: usize,
    snapshot: RwLock<Arc<RingSnapshot>>,
    /// Live nodes plus nodes being drained by a running migration
    nodes: DashMap<String, SharedCacheNode>,
    rebalance: Arc<Mutex<()>>,
    events: EventBus,
}

impl ShardRouter {
    /// Router with no nodes
    pub fn new(replicas: usize) -> Self {
        Self::with_nodes(replicas, Vec::new(), EventBus::default())
    }

    /// Router over an initial node set (no migration needed)
    pub fn with_nodes(replicas: usize, nodes: Vec<SharedCacheNode>, events: EventBus) -> Self {
        let ring = HashRing::with_nodes(replicas, nodes.iter().map(|n| n.id().to_string()));
        let map = DashMap::new();
        for node in nodes {
            map.insert(node.id().to_string(), node);
        }
        info!(nodes = ring.len(), replicas = ring.replicas(), "Shard ring initialized");

        Self {
            replicas,
            snapshot: RwLock::new(Arc::new(RingSnapshot {
                epoch: 0,
                current: Arc::new(ring),
                previous: None,
            })),
            nodes: map,
            rebalance: Arc::new(Mutex::new(())),
            events,
        }
    }

    /// Current ring snapshot
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    /// Owner id of a key
    pub fn route_id(&self, key: &str) -> Result<String> {
        self.snapshot()
            .owner(key)
            .map(str::to_string)
            .ok_or(Error::EmptyRing)
    }

    /// Owner node of a key
    pub fn route(&self, key: &str) -> Result<SharedCacheNode> {
        let id = self.route_id(key)?;
        self.node(&id).ok_or(Error::NodeNotFound { node_id: id })
    }

    /// Previous owner of a key while a migration is running
    pub fn previous_owner(&self, key: &str) -> Option<SharedCacheNode> {
        let snapshot = self.snapshot();
        let id = snapshot.previous_owner(key)?;
        self.node(id)
    }

    /// Node by id (live or draining)
    pub fn node(&self, node_id: &str) -> Option<SharedCacheNode> {
        self.nodes.get(node_id).map(|n| Arc::clone(n.value()))
    }

    /// Every node that may hold data, including draining ones
    pub fn all_nodes(&self) -> Vec<SharedCacheNode> {
        self.nodes.iter().map(|n| Arc::clone(n.value())).collect()
    }

    /// Ids of the nodes on the live ring
    pub fn node_ids(&self) -> Vec<String> {
        self.snapshot()
            .current
            .node_ids()
            .map(str::to_string)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().current.is_empty()
    }

    pub fn is_migrating(&self) -> bool {
        self.snapshot().is_migrating()
    }

    /// Add a node: publish the new ring, then migrate keys it now owns
    pub async fn add_node(self: &Arc<Self>, node: SharedCacheNode) -> Result<MigrationHandle> {
        let guard = Arc::clone(&self.rebalance).lock_owned().await;
        let node_id = node.id().to_string();
        let before = self.snapshot();

        if before.current.contains(&node_id) || self.nodes.contains_key(&node_id) {
            return Err(Error::NodeAlreadyRegistered { node_id });
        }

        self.nodes.insert(node_id.clone(), node);
        let published = self.publish(before.current.with_node(&node_id));
        info!(node_id = %node_id, epoch = published.epoch, "Node added to ring");
        self.events.publish(CacheEvent::NodeAdded {
            node_id: node_id.clone(),
        });

        let sources = before.current.node_ids().map(str::to_string).collect();
        Ok(self.spawn_migration(published, sources, None, guard))
    }

    /// Remove a node: publish the new ring, then drain the node
    pub async fn remove_node(self: &Arc<Self>, node_id: &str) -> Result<MigrationHandle> {
        let guard = Arc::clone(&self.rebalance).lock_owned().await;
        let before = self.snapshot();

        if !before.current.contains(node_id) {
            return Err(Error::NodeNotFound {
                node_id: node_id.to_string(),
            });
        }

        let published = self.publish(before.current.without_node(node_id));
        if published.current.is_empty() {
            warn!(node_id = %node_id, "Last node removed, distributed tier is now empty");
        }
        info!(node_id = %node_id, epoch = published.epoch, "Node removed from ring");
        self.events.publish(CacheEvent::NodeRemoved {
            node_id: node_id.to_string(),
        });

        Ok(self.spawn_migration(
            published,
            vec![node_id.to_string()],
            Some(node_id.to_string()),
            guard,
        ))
    }

    /// Key count and bytes per node
    pub async fn distribution(&self) -> Vec<ShardStats> {
        let mut stats = Vec::new();
        for node in self.all_nodes() {
            let node_id = node.id().to_string();
            match node.size().await {
                Ok(size) => stats.push(ShardStats {
                    node_id,
                    entries: size.entries,
                    bytes: size.bytes,
                    reachable: true,
                }),
                Err(e) => {
                    debug!(node_id = %node_id, error = %e, "Node did not report its size");
                    stats.push(ShardStats {
                        node_id,
                        reachable: false,
                        ..Default::default()
                    });
                }
            }
        }
        stats.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        stats
    }

    // -------------------------------------------------------------------------
    // Rebalance internals
    // -------------------------------------------------------------------------

    /// Swap in a new ring, keeping the old one as `previous`
    fn publish(&self, ring: HashRing) -> Arc<RingSnapshot> {
        let mut slot = self.snapshot.write();
        let next = Arc::new(RingSnapshot {
            epoch: slot.epoch + 1,
            current: Arc::new(ring),
            previous: Some(Arc::clone(&slot.current)),
        });
        *slot = Arc::clone(&next);
        next
    }

    fn spawn_migration(
        self: &Arc<Self>,
        target: Arc<RingSnapshot>,
        sources: Vec<String>,
        retiring: Option<String>,
        guard: OwnedMutexGuard<()>,
    ) -> MigrationHandle {
        let router = Arc::clone(self);
        let epoch = target.epoch;

        let join = tokio::spawn(async move {
            let _guard = guard;
            let started = Instant::now();
            let mut report = MigrationReport {
                epoch,
                ..Default::default()
            };

            for source_id in &sources {
                let Some(source) = router.node(source_id) else {
                    continue;
                };
                let keys = match source.keys().await {
                    Ok(keys) => keys,
                    Err(e) => {
                        warn!(node_id = %source_id, error = %e, "Cannot list keys for migration");
                        continue;
                    }
                };

                for key in keys {
                    report.keys_examined += 1;
                    let Some(owner_id) = target.owner(&key) else {
                        continue;
                    };
                    if owner_id == source_id {
                        continue;
                    }
                    match router.move_key(&source, owner_id, &key).await {
                        Ok(true) => report.keys_moved += 1,
                        Ok(false) => {}
                        Err(e) => {
                            report.keys_failed += 1;
                            warn!(key = %key, to = %owner_id, error = %e, "Key migration failed");
                        }
                    }
                }
            }

            router.finish_migration(epoch, retiring.as_deref());
            report.duration_ms = started.elapsed().as_millis() as u64;
            info!(
                epoch,
                examined = report.keys_examined,
                moved = report.keys_moved,
                failed = report.keys_failed,
                duration_ms = report.duration_ms,
                "Ring migration complete"
            );
            router.events.publish(CacheEvent::MigrationComplete {
                keys_examined: report.keys_examined,
                keys_moved: report.keys_moved,
                keys_failed: report.keys_failed,
            });
            report
        });

        MigrationHandle { epoch, join }
    }

    /// Copy one key to its new owner and drop it from the old one
    ///
    /// A value already present on the new owner was written after the
    /// rebalance and wins. If the source copy changed or vanished while it
    /// was being copied, a delete raced the move and the copy is dropped.
    async fn move_key(&self, source: &SharedCacheNode, owner_id: &str, key: &str) -> Result<bool> {
        let owner = self.node(owner_id).ok_or_else(|| Error::NodeNotFound {
            node_id: owner_id.to_string(),
        })?;

        let entry = match source.get(key).await? {
            StoreRead::Hit(entry) => entry,
            StoreRead::Miss | StoreRead::Expired => return Ok(false),
        };
        let version = entry.version;
        if !matches!(owner.get(key).await?, StoreRead::Hit(_)) {
            owner.set(entry).await?;
            match source.get(key).await? {
                StoreRead::Hit(current) if current.version == version => {}
                _ => {
                    debug!(key = %key, to = %owner_id, "Key changed during migration, copy dropped");
                    owner.delete(key).await?;
                    return Ok(false);
                }
            }
        }
        source.delete(key).await?;
        Ok(true)
    }

    fn finish_migration(&self, epoch: u64, retiring: Option<&str>) {
        {
            let mut slot = self.snapshot.write();
            if slot.epoch == epoch {
                let current = Arc::clone(&slot.current);
                *slot = Arc::new(RingSnapshot {
                    epoch,
                    current,
                    previous: None,
                });
            }
        }
        if let Some(node_id) = retiring {
            if !self.snapshot().current.contains(node_id) {
                self.nodes.remove(node_id);
            }
        }
    }

    /// Configured virtual replicas per node
    pub fn replicas(&self) -> usize {
        self.replicas
    }
}
