use super::node::{Node, NodeHandle, NodeStatus};
use std::{
    collections::VecDeque,
    slice::Iter,
    time::{Duration, Instant},
};

/// Maximum number of live nodes in a bucket (the Kademlia K constant).
pub const BUCKET_SIZE: usize = 8;

/// Maximum number of replacement candidates kept per bucket.
pub const REPLACEMENT_CACHE_SIZE: usize = 8;

/// Outcome of trying to place a node into a bucket.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The node was inserted, either into a free slot or by replacing a bad
    /// node or by updating an entry with the same id and address.
    Inserted,
    /// The bucket is full of non-bad nodes. The caller decides whether to
    /// split the bucket or park the node in the replacement cache.
    Full,
}

/// Bucket holding nodes with a common id prefix plus a bounded cache of
/// replacement candidates for when one of the live nodes goes bad.
pub struct Bucket {
    nodes: Vec<Node>,
    cache: VecDeque<NodeHandle>,
    last_changed: Instant,
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            nodes: Vec::with_capacity(BUCKET_SIZE),
            cache: VecDeque::new(),
            last_changed: Instant::now(),
        }
    }

    /// Iterator over every live node in the bucket.
    pub fn iter(&self) -> Iter<Node> {
        self.nodes.iter()
    }

    /// Iterator over good and questionable nodes.
    pub fn pingable_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|node| node.is_pingable())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn find_mut(&mut self, handle: &NodeHandle) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|node| node.handle() == handle)
    }

    /// Try to place the node into the bucket.
    ///
    /// An existing entry with the same handle absorbs any fresher liveness
    /// information instead of being overwritten, so locally accumulated
    /// history is never erased by a reinsert.
    pub fn try_insert(&mut self, node: Node) -> InsertOutcome {
        if let Some(index) = self.nodes.iter().position(|n| *n == node) {
            if node.status() == NodeStatus::Good {
                self.nodes[index].record_success();
            }
            self.touch();
            return InsertOutcome::Inserted;
        }

        if self.nodes.len() < BUCKET_SIZE {
            self.cache.retain(|cached| cached != node.handle());
            self.nodes.push(node);
            self.touch();
            return InsertOutcome::Inserted;
        }

        // Full. A bad node gives up its slot to the newcomer.
        if let Some(index) = self
            .nodes
            .iter()
            .position(|n| n.status() == NodeStatus::Bad)
        {
            self.nodes[index] = node;
            self.touch();
            return InsertOutcome::Inserted;
        }

        InsertOutcome::Full
    }

    /// Park a node in the replacement cache, dropping the oldest candidate
    /// when the cache is full.
    pub fn cache_replacement(&mut self, handle: NodeHandle) {
        if self.cache.contains(&handle) {
            return;
        }

        if self.cache.len() == REPLACEMENT_CACHE_SIZE {
            self.cache.pop_front();
        }

        self.cache.push_back(handle);
    }

    pub fn cached_replacements(&self) -> usize {
        self.cache.len()
    }

    /// Evict one bad node, promoting the most recent replacement candidate
    /// into its slot. A bad node with no candidate available is retained.
    ///
    /// Returns true if an eviction took place.
    pub fn evict_bad_node(&mut self) -> bool {
        if self.cache.is_empty() {
            return false;
        }

        let index = match self
            .nodes
            .iter()
            .position(|n| n.status() == NodeStatus::Bad)
        {
            Some(index) => index,
            None => return false,
        };

        // Unwrap is fine, emptiness was checked above.
        let handle = self.cache.pop_back().unwrap();
        self.nodes[index] = Node::new_contact(handle.id, handle.addr);
        self.touch();

        true
    }

    /// Remember that the bucket saw activity, for refresh staleness tracking.
    pub fn touch(&mut self) {
        self.last_changed = Instant::now();
    }

    /// A bucket with no activity within `period` needs a refresh.
    pub fn is_stale(&self, period: Duration) -> bool {
        Instant::now().saturating_duration_since(self.last_changed) >= period
    }
}

impl Default for Bucket {
    fn default() -> Self {
        Self::new()
    }
}
