//! Kademlia routing table: 256 K-buckets indexed by common prefix length
//! with the local id, each guarded by its own lock.

pub mod bucket;

use crate::distance::{bucket_index, compare_distance, NUM_BUCKETS};
use crate::types::{NodeId, RoutingNode};
use bucket::KBucket;
use parking_lot::RwLock;
use std::time::Duration;

/// Summary counters for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingTableStats {
    pub total_nodes: usize,
    pub non_empty_buckets: usize,
    pub full_buckets: usize,
    pub k: usize,
}

pub struct RoutingTable {
    local: NodeId,
    buckets: Vec<RwLock<KBucket>>,
    k: usize,
    node_expire_secs: u64,
}

impl RoutingTable {
    pub fn new(local: NodeId, k: usize, node_expire: Duration) -> Self {
        let buckets = (0..NUM_BUCKETS).map(|_| RwLock::new(KBucket::new())).collect();
        RoutingTable {
            local,
            buckets,
            k,
            node_expire_secs: node_expire.as_secs(),
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Insert or refresh a node. Returns whether it is now in the live list.
    /// The local node is never added.
    pub fn add(&self, node: RoutingNode) -> bool {
        if node.node_id == self.local {
            return false;
        }
        let idx = bucket_index(&self.local, &node.node_id);
        self.buckets[idx].write().upsert(node, self.k)
    }

    pub fn remove(&self, id: &NodeId) -> bool {
        let idx = bucket_index(&self.local, id);
        self.buckets[idx].write().remove(id)
    }

    pub fn get(&self, id: &NodeId) -> Option<RoutingNode> {
        let idx = bucket_index(&self.local, id);
        self.buckets[idx].read().get(id).cloned()
    }

    /// Apply `f` to a live node; no-op if the node is not tracked.
    pub fn update<F: FnOnce(&mut RoutingNode)>(&self, id: &NodeId, f: F) {
        let idx = bucket_index(&self.local, id);
        if let Some(node) = self.buckets[idx].write().get_mut(id) {
            f(node);
        }
    }

    /// Number of live nodes across all buckets.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.read().live_len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn all_nodes(&self) -> Vec<RoutingNode> {
        let mut nodes = Vec::new();
        for bucket in &self.buckets {
            nodes.extend_from_slice(bucket.read().live());
        }
        nodes
    }

    /// Up to `n` live nodes sorted by XOR distance to `target`.
    pub fn nearest_peers(&self, target: &NodeId, n: usize) -> Vec<RoutingNode> {
        let mut nodes = self.all_nodes();
        nodes.sort_by(|a, b| compare_distance(&a.node_id, &b.node_id, target));
        nodes.truncate(n);
        nodes
    }

    /// Drop every node whose `last_seen` is older than the expiry window.
    pub fn remove_expired_nodes(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.write().remove_expired(self.node_expire_secs))
            .sum()
    }

    /// Indices of buckets that are non-empty and overdue for a refresh probe.
    pub fn buckets_needing_refresh(&self, interval: Duration) -> Vec<usize> {
        let secs = interval.as_secs();
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                let bucket = b.read();
                bucket.live_len() > 0 && bucket.needs_refresh(secs)
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn mark_bucket_refreshed(&self, index: usize) {
        if let Some(bucket) = self.buckets.get(index) {
            bucket.write().mark_refreshed();
        }
    }

    /// A random id that lands in bucket `index` relative to the local id:
    /// shares exactly `index` prefix bits, with the rest randomized.
    pub fn random_id_in_bucket(&self, index: usize) -> NodeId {
        let mut bytes = *self.local.as_bytes();
        let index = index.min(NUM_BUCKETS - 1);
        let byte_idx = index / 8;
        let bit_idx = index % 8;
        // Flip the bit at `index` so the common prefix stops there.
        bytes[byte_idx] ^= 0x80 >> bit_idx;
        // Randomize everything after it.
        let mut random = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut random);
        for bit in (index + 1)..NUM_BUCKETS {
            let bi = bit / 8;
            let mask = 0x80u8 >> (bit % 8);
            if random[bi] & mask != 0 {
                bytes[bi] ^= mask;
            }
        }
        NodeId::from_bytes(bytes)
    }

    pub fn stats(&self) -> RoutingTableStats {
        let mut total = 0;
        let mut non_empty = 0;
        let mut full = 0;
        for bucket in &self.buckets {
            let len = bucket.read().live_len();
            total += len;
            if len > 0 {
                non_empty += 1;
            }
            if len >= self.k {
                full += 1;
            }
        }
        RoutingTableStats {
            total_nodes: total,
            non_empty_buckets: non_empty,
            full_buckets: full,
            k: self.k,
        }
    }
}
