use crate::id::NodeId;
use std::{
    fmt::{self, Debug, Formatter},
    hash::{Hash, Hasher},
    net::SocketAddr,
    time::{Duration, Instant},
};

/// How long a node stays good after we last heard from it.
const GOOD_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Consecutive transaction failures before a node turns bad.
pub const MAX_CONSECUTIVE_FAILURES: u8 = 3;

/// Liveness of a node.
/// Ordering of the variants matters, variants further down are better.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Ord, PartialOrd)]
pub enum NodeStatus {
    Bad,
    Questionable,
    Good,
}

/// Node id + its socket address.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct NodeHandle {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeHandle {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }
}

/// Node participating in the DHT together with the liveness bookkeeping that
/// drives eviction and refresh decisions.
#[derive(Clone)]
pub struct Node {
    handle: NodeHandle,
    last_response: Option<Instant>,
    last_query: Option<Instant>,
    failed_queries: u8,
}

impl Node {
    /// A node we learned about but have not verified yet. It starts out
    /// questionable and becomes good on its first successful transaction.
    pub fn new_contact(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            handle: NodeHandle { id, addr },
            last_response: None,
            last_query: None,
            failed_queries: 0,
        }
    }

    /// A node that just responded to us (or sent us a well-formed query).
    pub fn new_verified(id: NodeId, addr: SocketAddr) -> Self {
        Self {
            handle: NodeHandle { id, addr },
            last_response: Some(Instant::now()),
            last_query: None,
            failed_queries: 0,
        }
    }

    pub fn id(&self) -> NodeId {
        self.handle.id
    }

    pub fn handle(&self) -> &NodeHandle {
        &self.handle
    }

    /// Record a successful transaction with the node. Resets the failure
    /// counter and marks the node good.
    pub fn record_success(&mut self) {
        self.last_response = Some(Instant::now());
        self.failed_queries = 0;
    }

    /// Record a failed (timed out or errored) transaction with the node.
    pub fn record_failure(&mut self) {
        self.failed_queries = self.failed_queries.saturating_add(1);
    }

    /// Record that the node sent us a query.
    pub fn record_remote_query(&mut self) {
        self.last_query = Some(Instant::now());
    }

    pub fn failed_queries(&self) -> u8 {
        self.failed_queries
    }

    /// Timestamp of the most recent contact in either direction, if any.
    pub fn last_contact(&self) -> Option<Instant> {
        self.last_response.max(self.last_query)
    }

    /// Current liveness of the node.
    ///
    /// Bad beats everything: a node that failed three transactions in a row
    /// stays bad until it responds again. A node that responded recently, or
    /// ever responded and queried us recently, is good. Everything else,
    /// including freshly inserted unverified contacts, is questionable.
    pub fn status(&self) -> NodeStatus {
        if self.failed_queries >= MAX_CONSECUTIVE_FAILURES {
            return NodeStatus::Bad;
        }

        let now = Instant::now();

        let responded = match self.last_response {
            Some(at) => {
                if now.saturating_duration_since(at) < GOOD_WINDOW {
                    return NodeStatus::Good;
                }
                true
            }
            None => false,
        };

        if responded {
            if let Some(at) = self.last_query {
                if now.saturating_duration_since(at) < GOOD_WINDOW {
                    return NodeStatus::Good;
                }
            }
        }

        NodeStatus::Questionable
    }

    /// Is the node worth contacting (good or questionable)?
    pub fn is_pingable(&self) -> bool {
        self.status() != NodeStatus::Bad
    }
}

impl Eq for Node {}

impl PartialEq<Node> for Node {
    fn eq(&self, other: &Node) -> bool {
        self.handle == other.handle
    }
}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.handle.hash(state);
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Node")
            .field("id", &self.handle.id)
            .field("addr", &self.handle.addr)
            .field("failed_queries", &self.failed_queries)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn positive_new_contact_is_questionable() {
        let node = Node::new_contact(test::dummy_node_id(), test::dummy_socket_addr_v4());

        assert_eq!(node.status(), NodeStatus::Questionable);
    }

    #[test]
    fn positive_new_verified_is_good() {
        let node = Node::new_verified(test::dummy_node_id(), test::dummy_socket_addr_v4());

        assert_eq!(node.status(), NodeStatus::Good);
    }

    #[test]
    fn positive_success_marks_good() {
        let mut node = Node::new_contact(test::dummy_node_id(), test::dummy_socket_addr_v4());

        node.record_success();

        assert_eq!(node.status(), NodeStatus::Good);
    }

    #[test]
    fn positive_three_failures_mark_bad() {
        let mut node = Node::new_verified(test::dummy_node_id(), test::dummy_socket_addr_v4());

        for _ in 0..MAX_CONSECUTIVE_FAILURES - 1 {
            node.record_failure();
        }
        assert_ne!(node.status(), NodeStatus::Bad);

        node.record_failure();
        assert_eq!(node.status(), NodeStatus::Bad);
    }

    #[test]
    fn positive_success_resets_failures() {
        let mut node = Node::new_verified(test::dummy_node_id(), test::dummy_socket_addr_v4());

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            node.record_failure();
        }
        assert_eq!(node.status(), NodeStatus::Bad);

        node.record_success();
        assert_eq!(node.status(), NodeStatus::Good);
        assert_eq!(node.failed_queries(), 0);
    }

    #[test]
    fn positive_status_ordering() {
        assert!(NodeStatus::Good > NodeStatus::Questionable);
        assert!(NodeStatus::Questionable > NodeStatus::Bad);
    }
}
