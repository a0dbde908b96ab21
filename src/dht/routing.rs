use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use super::node::{Node, NodeId};
use crate::constants::{DHT_BUCKET_REFRESH_INTERVAL, DHT_K, DHT_NUM_BUCKETS};

/// Outcome of offering a node to the routing table.
#[derive(Debug, Clone)]
pub enum InsertOutcome {
    /// Appended to a bucket with room.
    Added,
    /// The node was already present; its liveness was refreshed.
    Refreshed,
    /// The bucket is full. The caller should ping the returned
    /// least-recently-seen occupant: if it answers, the new node is
    /// discarded; if not, evict it and insert the new node via
    /// [`RoutingTable::evict_and_insert`].
    BucketFull { oldest: Node },
    /// The node is our own id and was ignored.
    Ignored,
}

struct Bucket {
    nodes: VecDeque<Node>,
    last_touched: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            nodes: VecDeque::with_capacity(DHT_K),
            last_touched: Instant::now(),
        }
    }
}

/// The Kademlia routing table: 160 insertion-ordered buckets of up to
/// K = 8 nodes, indexed by the most significant differing bit between a
/// node id and ours. Each bucket carries its own lock.
pub struct RoutingTable {
    our_id: NodeId,
    buckets: Vec<RwLock<Bucket>>,
}

impl RoutingTable {
    pub fn new(our_id: NodeId) -> Self {
        let buckets = (0..DHT_NUM_BUCKETS)
            .map(|_| RwLock::new(Bucket::new()))
            .collect();
        Self { our_id, buckets }
    }

    pub fn our_id(&self) -> &NodeId {
        &self.our_id
    }

    /// Offers a node to its bucket.
    ///
    /// A node appears in exactly one bucket; re-offering an existing id
    /// refreshes its last-seen time instead of duplicating it.
    pub fn offer(&self, node: Node) -> InsertOutcome {
        if node.id == self.our_id {
            return InsertOutcome::Ignored;
        }

        let idx = self.our_id.bucket_index(&node.id);
        let mut bucket = self.buckets[idx].write();
        bucket.last_touched = Instant::now();

        if let Some(existing) = bucket.nodes.iter_mut().find(|n| n.id == node.id) {
            existing.addr = node.addr;
            existing.touch();
            return InsertOutcome::Refreshed;
        }

        if bucket.nodes.len() < DHT_K {
            bucket.nodes.push_back(node);
            return InsertOutcome::Added;
        }

        // Questionable occupants are the first eviction candidates;
        // otherwise the least recently seen node is probed.
        let oldest = bucket
            .nodes
            .iter()
            .find(|n| n.questionable)
            .or_else(|| bucket.nodes.front())
            .cloned()
            .expect("full bucket has a front");
        InsertOutcome::BucketFull { oldest }
    }

    /// Completes the ping-evict flow: removes `evicted` and inserts
    /// `replacement` if the bucket still has the evictee and room follows.
    pub fn evict_and_insert(&self, evicted: &NodeId, replacement: Node) {
        if replacement.id == self.our_id {
            return;
        }

        let idx = self.our_id.bucket_index(evicted);
        let mut bucket = self.buckets[idx].write();
        if let Some(pos) = bucket.nodes.iter().position(|n| &n.id == evicted) {
            let _ = bucket.nodes.remove(pos);
        }

        // Only insert when the replacement belongs to the same bucket and
        // no concurrent insert refilled it.
        if self.our_id.bucket_index(&replacement.id) == idx
            && bucket.nodes.len() < DHT_K
            && !bucket.nodes.iter().any(|n| n.id == replacement.id)
        {
            bucket.nodes.push_back(replacement);
        }
    }

    /// Marks a node questionable after a failed query. Questionable nodes
    /// are the first to go when their bucket next needs space.
    pub fn mark_questionable(&self, id: &NodeId) {
        let idx = self.our_id.bucket_index(id);
        let mut bucket = self.buckets[idx].write();
        if let Some(node) = bucket.nodes.iter_mut().find(|n| &n.id == id) {
            node.mark_questionable();
        }
    }

    pub fn mark_seen(&self, id: &NodeId) {
        let idx = self.our_id.bucket_index(id);
        let mut bucket = self.buckets[idx].write();
        if let Some(node) = bucket.nodes.iter_mut().find(|n| &n.id == id) {
            node.touch();
        }
    }

    /// The `count` nodes closest to `target` by XOR distance.
    pub fn find_closest(&self, target: &NodeId, count: usize) -> Vec<Node> {
        let mut nodes: Vec<(Node, [u8; 20])> = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.read();
            for node in &bucket.nodes {
                nodes.push((node.clone(), node.id.distance(target)));
            }
        }

        nodes.sort_by(|a, b| a.1.cmp(&b.1));
        nodes.truncate(count);
        nodes.into_iter().map(|(n, _)| n).collect()
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(|b| b.read().nodes.len()).sum()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        let idx = self.our_id.bucket_index(id);
        self.buckets[idx].read().nodes.iter().any(|n| &n.id == id)
    }

    /// Indices of buckets that have gone a refresh interval untouched.
    pub fn stale_buckets(&self) -> Vec<usize> {
        self.stale_buckets_since(DHT_BUCKET_REFRESH_INTERVAL)
    }

    pub fn stale_buckets_since(&self, age: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| {
                let b = b.read();
                !b.nodes.is_empty() && b.last_touched.elapsed() >= age
            })
            .map(|(i, _)| i)
            .collect()
    }
}
