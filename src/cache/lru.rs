//! LRU Recency Index
//!
//! A doubly linked list threaded through an `IndexMap` so that the least and
//! most recently used keys, and any key by name, are all reachable in O(1).
//! Each node carries a byte weight, which makes the same structure serve the
//! size-aware variant: [`LruIndex::evict_until`] keeps removing victims until
//! both the count and weight limits hold.
//!
//! Ties are broken by insertion order: two keys inserted without an
//! intervening access are evicted in the order they were inserted.

use indexmap::IndexMap;

/// Sentinel for "no neighbour"
const NIL: usize = usize::MAX;

// =============================================================================
// Recency Node
// =============================================================================

/// Per-key recency record
#[derive(Debug, Clone, Copy)]
struct Node {
    /// Towards the least recently used end
    prev: usize,
    /// Towards the most recently used end
    next: usize,
    /// Byte weight of the entry
    weight: u64,
}

// =============================================================================
// LRU Index
// =============================================================================

/// Recency order over a bounded set of keys
#[derive(Debug)]
pub struct LruIndex {
    nodes: IndexMap<String, Node>,
    /// Least recently used
    head: usize,
    /// Most recently used
    tail: usize,
    total_weight: u64,
}

impl Default for LruIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl LruIndex {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: IndexMap::with_capacity(capacity),
            head: NIL,
            tail: NIL,
            total_weight: 0,
        }
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sum of all tracked weights
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    /// Weight recorded for a key
    pub fn weight(&self, key: &str) -> Option<u64> {
        self.nodes.get(key).map(|n| n.weight)
    }

    /// Track a key as most recently used
    ///
    /// Re-inserting an existing key updates its weight and moves it to the
    /// most recent end. Returns true if the key was new.
    pub fn insert(&mut self, key: &str, weight: u64) -> bool {
        if let Some(idx) = self.nodes.get_index_of(key) {
            let old = self.nodes[idx].weight;
            self.nodes[idx].weight = weight;
            self.total_weight = self.total_weight - old + weight;
            self.move_to_back(idx);
            return false;
        }

        let (idx, _) = self.nodes.insert_full(
            key.to_string(),
            Node {
                prev: NIL,
                next: NIL,
                weight,
            },
        );
        self.total_weight += weight;
        self.push_back(idx);
        true
    }

    /// Mark a key as just accessed
    pub fn touch(&mut self, key: &str) -> bool {
        match self.nodes.get_index_of(key) {
            Some(idx) => {
                self.move_to_back(idx);
                true
            }
            None => false,
        }
    }

    /// Stop tracking a key, returning its weight
    pub fn remove(&mut self, key: &str) -> Option<u64> {
        let idx = self.nodes.get_index_of(key)?;
        Some(self.remove_index(idx).1)
    }

    /// Remove and return the least recently used key
    pub fn evict(&mut self) -> Option<(String, u64)> {
        if self.head == NIL {
            return None;
        }
        Some(self.remove_index(self.head))
    }

    /// Evict least recently used keys until neither limit is exceeded
    ///
    /// A limit of zero disables that dimension. Victims are returned oldest
    /// first.
    pub fn evict_until(&mut self, max_entries: usize, max_weight: u64) -> Vec<(String, u64)> {
        let mut victims = Vec::new();
        while (max_entries > 0 && self.len() > max_entries)
            || (max_weight > 0 && self.total_weight > max_weight)
        {
            match self.evict() {
                Some(victim) => victims.push(victim),
                None => break,
            }
        }
        victims
    }

    /// Least recently used key
    pub fn peek_lru(&self) -> Option<&str> {
        self.key_at(self.head)
    }

    /// Most recently used key
    pub fn peek_mru(&self) -> Option<&str> {
        self.key_at(self.tail)
    }

    /// Keys from least to most recently used
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let (key, node) = self.nodes.get_index(cursor)?;
            cursor = node.next;
            Some(key.as_str())
        })
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.head = NIL;
        self.tail = NIL;
        self.total_weight = 0;
    }

    // -------------------------------------------------------------------------
    // List plumbing
    // -------------------------------------------------------------------------

    fn key_at(&self, idx: usize) -> Option<&str> {
        self.nodes.get_index(idx).map(|(k, _)| k.as_str())
    }

    fn unlink(&mut self, idx: usize) {
        let Node { prev, next, .. } = self.nodes[idx];
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_back(&mut self, idx: usize) {
        self.nodes[idx].prev = self.tail;
        self.nodes[idx].next = NIL;
        if self.tail == NIL {
            self.head = idx;
        } else {
            self.nodes[self.tail].next = idx;
        }
        self.tail = idx;
    }

    fn move_to_back(&mut self, idx: usize) {
        if self.tail == idx {
            return;
        }
        self.unlink(idx);
        self.push_back(idx);
    }

    /// Unlink and swap-remove; the former last slot moves into `idx`
    fn remove_index(&mut self, idx: usize) -> (String, u64) {
        self.unlink(idx);
        let last = self.nodes.len() - 1;
        let (key, node) = match self.nodes.swap_remove_index(idx) {
            Some(removed) => removed,
            None => unreachable!("index {} came from the map", idx),
        };
        self.total_weight -= node.weight;

        if idx != last {
            // Re-point the neighbours of the moved node at its new slot
            let Node { prev, next, .. } = self.nodes[idx];
            if prev == NIL {
                self.head = idx;
            } else {
                self.nodes[prev].next = idx;
            }
            if next == NIL {
                self.tail = idx;
            } else {
                self.nodes[next].prev = idx;
            }
        }

        (key, node.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(lru: &LruIndex) -> Vec<&str> {
        lru.iter().collect()
    }

    #[test]
    fn test_insertion_order_breaks_ties() {
        let mut lru = LruIndex::new();
        lru.insert("a", 1);
        lru.insert("b", 1);
        lru.insert("c", 1);

        assert_eq!(order(&lru), vec!["a", "b", "c"]);
        assert_eq!(lru.peek_lru(), Some("a"));
        assert_eq!(lru.peek_mru(), Some("c"));
        assert_eq!(lru.evict(), Some(("a".to_string(), 1)));
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let mut lru = LruIndex::new();
        lru.insert("a", 1);
        lru.insert("b", 1);
        assert!(lru.touch("a"));
        lru.insert("c", 1);

        let victims = lru.evict_until(2, 0);
        assert_eq!(victims, vec![("b".to_string(), 1)]);
        assert_eq!(order(&lru), vec!["a", "c"]);
        assert!(!lru.touch("b"));
    }

    #[test]
    fn test_reinsert_updates_weight() {
        let mut lru = LruIndex::new();
        lru.insert("a", 10);
        lru.insert("b", 5);
        assert!(!lru.insert("a", 20));

        assert_eq!(lru.total_weight(), 25);
        assert_eq!(lru.weight("a"), Some(20));
        assert_eq!(order(&lru), vec!["b", "a"]);
    }

    #[test]
    fn test_size_aware_eviction_takes_multiple_victims() {
        let mut lru = LruIndex::new();
        for key in ["a", "b", "c", "d"] {
            lru.insert(key, 10);
        }
        lru.insert("big", 25);

        let victims = lru.evict_until(0, 40);
        let evicted: Vec<_> = victims.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(evicted, vec!["a", "b", "c"]);
        assert_eq!(lru.total_weight(), 35);
        assert_eq!(order(&lru), vec!["d", "big"]);
    }

    #[test]
    fn test_remove_keeps_links_consistent() {
        let mut lru = LruIndex::new();
        for key in ["a", "b", "c", "d", "e"] {
            lru.insert(key, 1);
        }
        // Removing from the middle swaps "e" into a new slot
        assert_eq!(lru.remove("b"), Some(1));
        lru.touch("a");
        assert_eq!(lru.remove("d"), Some(1));
        assert_eq!(order(&lru), vec!["c", "e", "a"]);

        assert_eq!(lru.evict().map(|(k, _)| k), Some("c".to_string()));
        assert_eq!(lru.evict().map(|(k, _)| k), Some("e".to_string()));
        assert_eq!(lru.evict().map(|(k, _)| k), Some("a".to_string()));
        assert!(lru.evict().is_none());
        assert!(lru.is_empty());
        assert_eq!(lru.total_weight(), 0);
    }

    #[test]
    fn test_clear() {
        let mut lru = LruIndex::new();
        lru.insert("a", 3);
        lru.clear();
        assert!(lru.is_empty());
        assert!(lru.peek_lru().is_none());
        lru.insert("b", 1);
        assert_eq!(order(&lru), vec!["b"]);
    }
}
