use super::{
    bucket::{Bucket, InsertOutcome, BUCKET_SIZE},
    node::{Node, NodeHandle, NodeStatus},
};
use crate::id::{NodeId, NODE_ID_LEN};
use rand::Rng;
use std::time::Duration;

/// Maximum number of buckets, one per bit of the id space.
pub const MAX_BUCKETS: usize = NODE_ID_LEN * 8;

/// Kademlia routing table over the XOR metric.
///
/// Buckets are kept in a flat list ordered by the number of leading bits
/// their range shares with the local id. The last bucket is the catch-all
/// that always contains the local id's own range; only that bucket is ever
/// split. This keeps the buckets a gapless, non-overlapping partition of the
/// whole id space while bounding the table to O(K * log n) nodes.
pub struct RoutingTable {
    buckets: Vec<Bucket>,
    local_id: NodeId,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            buckets: vec![Bucket::new()],
            local_id,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn buckets(&self) -> impl Iterator<Item = &Bucket> + ExactSizeIterator {
        self.buckets.iter()
    }

    /// Number of live (non-evicted) nodes across all buckets.
    pub fn num_nodes(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    /// Add a node to the table.
    ///
    /// A full bucket on the path to the local id is split and placement is
    /// retried; any other full bucket parks the newcomer in its replacement
    /// cache instead.
    pub fn add_node(&mut self, node: Node) {
        // Our own id never goes into the table.
        if node.id() == self.local_id {
            return;
        }

        let shared_bits = shared_prefix_len(self.local_id, node.id());

        loop {
            let index = bucket_index(shared_bits, self.buckets.len());

            match self.buckets[index].try_insert(node.clone()) {
                InsertOutcome::Inserted => return,
                InsertOutcome::Full => {
                    if self.can_split(index) {
                        self.split_last_bucket();
                    } else {
                        self.buckets[index].cache_replacement(*node.handle());
                        return;
                    }
                }
            }
        }
    }

    /// Up to `count` pingable nodes closest to `target` by XOR distance.
    /// Ties are broken by status and then by most recent contact.
    pub fn closest_nodes(&self, target: NodeId, count: usize) -> Vec<NodeHandle> {
        let mut candidates: Vec<&Node> = self
            .buckets
            .iter()
            .flat_map(Bucket::pingable_nodes)
            .collect();

        candidates.sort_by(|a, b| {
            target
                .distance(a.id())
                .cmp(&target.distance(b.id()))
                .then_with(|| b.status().cmp(&a.status()))
                .then_with(|| b.last_contact().cmp(&a.last_contact()))
        });

        candidates
            .into_iter()
            .take(count)
            .map(|node| *node.handle())
            .collect()
    }

    pub fn find_node_mut(&mut self, handle: &NodeHandle) -> Option<&mut Node> {
        let index = self.bucket_index_of(handle.id);
        self.buckets[index].find_mut(handle)
    }

    /// Feed a successful transaction with the node back into the table.
    pub fn record_success(&mut self, handle: &NodeHandle) {
        let index = self.bucket_index_of(handle.id);
        let bucket = &mut self.buckets[index];

        if let Some(node) = bucket.find_mut(handle) {
            node.record_success();
            bucket.touch();
        } else {
            self.add_node(Node::new_verified(handle.id, handle.addr));
        }
    }

    /// Feed a failed transaction back into the table. A node pushed over the
    /// failure threshold is evicted right away when its bucket has a
    /// replacement candidate, otherwise it lingers as bad until one shows up.
    pub fn record_failure(&mut self, handle: &NodeHandle) {
        let index = self.bucket_index_of(handle.id);
        let bucket = &mut self.buckets[index];

        let went_bad = match bucket.find_mut(handle) {
            Some(node) => {
                node.record_failure();
                node.status() == NodeStatus::Bad
            }
            None => false,
        };

        if went_bad {
            bucket.evict_bad_node();
        }
    }

    /// Note that the node sent us a query.
    pub fn record_remote_query(&mut self, handle: &NodeHandle) {
        let index = self.bucket_index_of(handle.id);
        let bucket = &mut self.buckets[index];

        if let Some(node) = bucket.find_mut(handle) {
            node.record_remote_query();
            bucket.touch();
        }
    }

    /// Indices of buckets with no activity within `period`.
    pub fn stale_buckets(&self, period: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| bucket.is_stale(period))
            .map(|(index, _)| index)
            .collect()
    }

    /// Random id within the range covered by the bucket at `index`, used as
    /// the target of a refresh lookup.
    pub fn refresh_target<R: Rng>(&self, index: usize, rng: &mut R) -> NodeId {
        self.local_id.random_at_depth(index, rng)
    }

    /// Good and questionable contacts for the persisted snapshot.
    pub fn contacts(&self) -> Vec<NodeHandle> {
        self.buckets
            .iter()
            .flat_map(Bucket::pingable_nodes)
            .map(|node| *node.handle())
            .collect()
    }

    fn bucket_index_of(&self, id: NodeId) -> usize {
        bucket_index(shared_prefix_len(self.local_id, id), self.buckets.len())
    }

    fn can_split(&self, index: usize) -> bool {
        index == self.buckets.len() - 1 && self.buckets.len() < MAX_BUCKETS
    }

    /// Split the catch-all bucket into a sorted bucket for ids sharing
    /// exactly `len - 1` bits and a new catch-all for everything closer.
    fn split_last_bucket(&mut self) {
        // The catch-all is replaced by two empty buckets and its nodes are
        // re-filed by their shared prefix. Its replacement candidates are
        // dropped, the next full insert repopulates the caches.
        let old = self
            .buckets
            .pop()
            .expect("routing table always holds at least one bucket");

        self.buckets.push(Bucket::new());
        self.buckets.push(Bucket::new());

        for node in old.iter() {
            let shared_bits = shared_prefix_len(self.local_id, node.id());
            let index = bucket_index(shared_bits, self.buckets.len());
            // Re-inserting into fresh buckets cannot overflow them.
            let _ = self.buckets[index].try_insert(node.clone());
        }
    }
}

/// Number of leading bits shared between two ids.
fn shared_prefix_len(a: NodeId, b: NodeId) -> usize {
    a.distance(b).leading_zeros() as usize
}

/// Bucket index for a node sharing `shared_bits` leading bits with the local
/// id, given the current number of buckets. Nodes whose ideal bucket has not
/// been split off yet land in the catch-all.
fn bucket_index(shared_bits: usize, num_buckets: usize) -> usize {
    shared_bits.min(num_buckets - 1)
}

/// Upper bound on the number of stored nodes, used by invariant checks.
#[cfg(test)]
fn max_nodes(num_buckets: usize) -> usize {
    num_buckets * BUCKET_SIZE
}
