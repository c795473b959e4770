//! In-Process Cache Node
//!
//! Implements the [`CacheNode`] port over a [`BoundedStore`] living in this
//! process. Used for standalone deployments and tests; a networked node
//! would implement the same port over its transport.

use crate::cache::entry::CacheEntry;
use crate::cache::invalidation::KeyPattern;
use crate::cache::storage::{BoundedStore, SetOutcome, StoreRead, TierSize};
use crate::cache::tier::TierConfig;
use crate::config::DistributedConfig;
use crate::domain::ports::{CacheNode, SharedCacheNode};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Distributed-tier node backed by local memory
pub struct LocalNode {
    id: String,
    store: BoundedStore,
    available: AtomicBool,
}

impl LocalNode {
    pub fn new(id: impl Into<String>, config: TierConfig) -> Self {
        Self {
            id: id.into(),
            store: BoundedStore::new(config),
            available: AtomicBool::new(true),
        }
    }

    /// One node per configured id, each with the configured capacity
    pub fn from_config(config: &DistributedConfig) -> Vec<Arc<LocalNode>> {
        config
            .nodes
            .iter()
            .map(|id| Arc::new(LocalNode::new(id.clone(), config.node_capacity.clone())))
            .collect()
    }

    /// [`from_config`](Self::from_config) as ring-ready handles
    pub fn shared_from_config(config: &DistributedConfig) -> Vec<SharedCacheNode> {
        Self::from_config(config)
            .into_iter()
            .map(|node| node as SharedCacheNode)
            .collect()
    }

    /// Take the node offline or bring it back (maintenance drain)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
        info!(node_id = %self.id, available, "Node availability changed");
    }

    pub fn store(&self) -> &BoundedStore {
        &self.store
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(Error::NodeUnreachable {
                node_id: self.id.clone(),
                reason: "node is offline".to_string(),
            })
        }
    }
}

#[async_trait]
impl CacheNode for LocalNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn get(&self, key: &str) -> Result<StoreRead> {
        self.check()?;
        Ok(self.store.get(key))
    }

    async fn set(&self, entry: CacheEntry) -> Result<SetOutcome> {
        self.check()?;
        Ok(self.store.insert(entry))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.store.remove(key).is_some())
    }

    async fn touch(&self, key: &str) -> Result<bool> {
        self.check()?;
        Ok(self.store.touch(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        Ok(self.store.expire(key, ttl))
    }

    async fn delete_matching(&self, pattern: &KeyPattern) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.store.remove_matching(|k| pattern.matches(k)))
    }

    async fn sweep_expired(&self) -> Result<usize> {
        self.check()?;
        Ok(self.store.sweep_expired().len())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        self.check()?;
        Ok(self.store.keys())
    }

    async fn clear(&self) -> Result<()> {
        self.check()?;
        self.store.clear();
        Ok(())
    }

    async fn size(&self) -> Result<TierSize> {
        self.check()?;
        Ok(TierSize {
            entries: self.store.len() as u64,
            bytes: self.store.bytes(),
        })
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_node_operations() {
        let node = LocalNode::new("node-a", TierConfig::with_max_entries(8));
        assert_eq!(node.id(), "node-a");

        node.set(CacheEntry::new("k", Bytes::from("v"), Duration::ZERO, false))
            .await
            .unwrap();
        assert_matches!(node.get("k").await.unwrap(), StoreRead::Hit(e) if e.value == Bytes::from("v"));
        assert_eq!(node.size().await.unwrap().entries, 1);
        assert!(node.delete("k").await.unwrap());
        assert_matches!(node.get("k").await.unwrap(), StoreRead::Miss);
    }

    #[tokio::test]
    async fn test_offline_node_is_unreachable() {
        let node = LocalNode::new("node-b", TierConfig::with_max_entries(8));
        node.set_available(false);
        assert_matches!(node.ping().await, Err(Error::NodeUnreachable { .. }));
        assert_matches!(node.get("k").await, Err(Error::NodeUnreachable { .. }));

        node.set_available(true);
        assert!(node.ping().await.is_ok());
    }

    #[test]
    fn test_nodes_from_config() {
        let config = DistributedConfig {
            nodes: vec!["cache-0".into(), "cache-1".into(), "cache-2".into()],
            ..Default::default()
        };
        let nodes = LocalNode::shared_from_config(&config);
        let ids: Vec<&str> = nodes.iter().map(|n| n.id()).collect();
        assert_eq!(ids, vec!["cache-0", "cache-1", "cache-2"]);
    }
}
