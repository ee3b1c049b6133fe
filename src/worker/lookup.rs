//! Iterative lookup converging on the nodes closest to a target id.
//!
//! Used for peer searches (get_peers), for bootstrapping (find_node towards
//! our own id) and for bucket refreshes (find_node towards a random id in
//! the bucket's range).

use crate::{
    id::{InfoHash, NodeId},
    routing::{bucket::BUCKET_SIZE, node::NodeHandle},
};
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tokio::sync::mpsc;

/// Queries in flight when the lookup starts.
const INITIAL_CONCURRENCY: usize = 4;

/// Queries kept in flight while the lookup iterates.
const CONCURRENCY: usize = 3;

/// Bound on remembered candidates. Only the closest ones matter.
const SHORTLIST_LEN: usize = 32;

/// Total queries a single lookup may issue.
const MAX_QUERIES: usize = 32;

/// A lookup making no progress at all is abandoned after this long.
pub(crate) const LOOKUP_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) enum LookupKind {
    /// Populate the routing table around `target`; no extra payload.
    FindNode,
    /// Find peers announced for the info hash, streaming them to `tx`, and
    /// optionally announce ourselves at the end.
    GetPeers {
        announce: bool,
        tx: mpsc::UnboundedSender<SocketAddr>,
    },
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum CandidateState {
    Unqueried,
    InFlight,
    Responded,
    Failed,
}

struct Candidate {
    handle: NodeHandle,
    state: CandidateState,
}

pub(crate) struct Lookup {
    target: NodeId,
    kind: LookupKind,
    /// Candidates sorted by distance to the target, closest first.
    shortlist: Vec<Candidate>,
    /// Announce tokens received from responders, keyed by node address.
    tokens: HashMap<SocketAddr, Vec<u8>>,
    in_flight: usize,
    queries_issued: usize,
}

impl Lookup {
    pub fn new(target: NodeId, kind: LookupKind, initial: Vec<NodeHandle>) -> Self {
        let mut lookup = Self {
            target,
            kind,
            shortlist: Vec::new(),
            tokens: HashMap::new(),
            in_flight: 0,
            queries_issued: 0,
        };
        lookup.add_candidates(initial);
        lookup
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn info_hash(&self) -> InfoHash {
        self.target
    }

    pub fn is_find_node(&self) -> bool {
        matches!(self.kind, LookupKind::FindNode)
    }

    /// Nodes to query first.
    pub fn start(&mut self) -> Vec<NodeHandle> {
        self.pick_queries(INITIAL_CONCURRENCY)
    }

    /// Process a response from `from`. Returns the next nodes to query.
    pub fn on_response(
        &mut self,
        from: &NodeHandle,
        nodes: Vec<NodeHandle>,
        values: Vec<SocketAddr>,
        token: Option<Vec<u8>>,
    ) -> Vec<NodeHandle> {
        self.settle(from, CandidateState::Responded);

        if let Some(token) = token {
            self.tokens.insert(from.addr, token);
        }

        if let LookupKind::GetPeers { tx, .. } = &self.kind {
            for peer in values {
                // A closed receiver means the caller lost interest, the
                // lookup still runs to completion to feed the table.
                tx.send(peer).ok();
            }
        }

        self.add_candidates(nodes);
        self.pick_queries(CONCURRENCY)
    }

    /// Process a failed query to `from`. Returns the next nodes to query.
    pub fn on_failure(&mut self, from: &NodeHandle) -> Vec<NodeHandle> {
        self.settle(from, CandidateState::Failed);
        self.pick_queries(CONCURRENCY)
    }

    /// The lookup is done when the closest known candidates have all been
    /// queried and nothing is in flight anymore, or the query budget ran out.
    pub fn is_done(&self) -> bool {
        if self.in_flight > 0 {
            return false;
        }

        if self.queries_issued >= MAX_QUERIES {
            return true;
        }

        self.shortlist
            .iter()
            .take(BUCKET_SIZE)
            .all(|candidate| {
                matches!(
                    candidate.state,
                    CandidateState::Responded | CandidateState::Failed
                )
            })
    }

    /// Did at least one node respond?
    pub fn responded(&self) -> bool {
        self.shortlist
            .iter()
            .any(|candidate| candidate.state == CandidateState::Responded)
    }

    /// Closest responders that handed us an announce token, for the final
    /// announce round of an announcing peer search.
    pub fn announce_targets(&self) -> Vec<(NodeHandle, Vec<u8>)> {
        if !matches!(self.kind, LookupKind::GetPeers { announce: true, .. }) {
            return Vec::new();
        }

        self.shortlist
            .iter()
            .filter(|candidate| candidate.state == CandidateState::Responded)
            .filter_map(|candidate| {
                let token = self.tokens.get(&candidate.handle.addr)?;
                Some((candidate.handle, token.clone()))
            })
            .take(BUCKET_SIZE)
            .collect()
    }

    fn add_candidates(&mut self, nodes: Vec<NodeHandle>) {
        for node in nodes {
            if self.shortlist.iter().any(|c| c.handle.addr == node.addr) {
                continue;
            }

            self.shortlist.push(Candidate {
                handle: node,
                state: CandidateState::Unqueried,
            });
        }

        let target = self.target;
        self.shortlist
            .sort_by_key(|candidate| target.distance(candidate.handle.id));

        // Never drop a settled or in-flight entry, their accounting is still
        // needed; only trim unqueried tail entries.
        while self.shortlist.len() > SHORTLIST_LEN {
            match self
                .shortlist
                .iter()
                .rposition(|c| c.state == CandidateState::Unqueried)
            {
                Some(index) => {
                    self.shortlist.remove(index);
                }
                None => break,
            }
        }
    }

    fn pick_queries(&mut self, concurrency: usize) -> Vec<NodeHandle> {
        let mut picked = Vec::new();

        for candidate in &mut self.shortlist {
            if self.in_flight >= concurrency || self.queries_issued >= MAX_QUERIES {
                break;
            }

            if candidate.state == CandidateState::Unqueried {
                candidate.state = CandidateState::InFlight;
                self.in_flight += 1;
                self.queries_issued += 1;
                picked.push(candidate.handle);
            }
        }

        picked
    }

    fn settle(&mut self, handle: &NodeHandle, state: CandidateState) {
        if let Some(candidate) = self
            .shortlist
            .iter_mut()
            .find(|c| c.handle.addr == handle.addr)
        {
            if candidate.state == CandidateState::InFlight {
                self.in_flight -= 1;
            }
            candidate.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    fn handles(count: u8) -> Vec<NodeHandle> {
        test::dummy_block_node_ids(count)
            .into_iter()
            .zip(test::dummy_block_socket_addrs(count as u16))
            .map(|(id, addr)| NodeHandle::new(id, addr))
            .collect()
    }

    #[test]
    fn positive_initial_concurrency() {
        let mut lookup = Lookup::new(test::dummy_node_id(), LookupKind::FindNode, handles(10));

        assert_eq!(lookup.start().len(), INITIAL_CONCURRENCY);
        assert!(!lookup.is_done());
    }

    #[test]
    fn positive_response_keeps_concurrency() {
        let mut lookup = Lookup::new(test::dummy_node_id(), LookupKind::FindNode, handles(10));
        let batch = lookup.start();

        // One response settles, dropping in-flight to 3, which is already at
        // the iterative limit: no new queries.
        let next = lookup.on_response(&batch[0], Vec::new(), Vec::new(), None);
        assert!(next.is_empty());

        // Another settles, freeing a slot.
        let next = lookup.on_response(&batch[1], Vec::new(), Vec::new(), None);
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn positive_terminates_when_closest_settled() {
        let initial = handles(3);
        let mut lookup = Lookup::new(test::dummy_node_id(), LookupKind::FindNode, initial.clone());

        let batch = lookup.start();
        assert_eq!(batch.len(), 3);

        for handle in &batch {
            lookup.on_response(handle, Vec::new(), Vec::new(), None);
        }

        assert!(lookup.is_done());
        assert!(lookup.responded());
    }

    #[test]
    fn positive_failures_terminate_too() {
        let mut lookup = Lookup::new(test::dummy_node_id(), LookupKind::FindNode, handles(2));

        for handle in lookup.start() {
            lookup.on_failure(&handle);
        }

        assert!(lookup.is_done());
        assert!(!lookup.responded());
    }

    #[test]
    fn positive_learned_nodes_extend_lookup() {
        let initial = handles(1);
        let mut lookup = Lookup::new(test::dummy_node_id(), LookupKind::FindNode, initial.clone());

        let batch = lookup.start();
        assert_eq!(batch.len(), 1);

        let learned = handles(6).split_off(1);
        let next = lookup.on_response(&initial[0], learned, Vec::new(), None);

        assert!(!next.is_empty());
        assert!(!lookup.is_done());
    }

    #[test]
    fn positive_peers_streamed_to_receiver() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let initial = handles(1);
        let mut lookup = Lookup::new(
            test::dummy_node_id(),
            LookupKind::GetPeers {
                announce: false,
                tx,
            },
            initial.clone(),
        );
        lookup.start();

        let peer = test::dummy_socket_addr_v4();
        lookup.on_response(&initial[0], Vec::new(), vec![peer], None);

        assert_eq!(rx.try_recv(), Ok(peer));
    }

    #[test]
    fn positive_announce_targets_require_token() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let initial = handles(2);
        let mut lookup = Lookup::new(
            test::dummy_node_id(),
            LookupKind::GetPeers { announce: true, tx },
            initial.clone(),
        );
        lookup.start();

        lookup.on_response(&initial[0], Vec::new(), Vec::new(), Some(b"tok".to_vec()));
        lookup.on_response(&initial[1], Vec::new(), Vec::new(), None);

        let targets = lookup.announce_targets();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, initial[0]);
        assert_eq!(targets[0].1, b"tok".to_vec());
    }

    #[test]
    fn negative_find_node_never_announces() {
        let initial = handles(1);
        let mut lookup = Lookup::new(test::dummy_node_id(), LookupKind::FindNode, initial.clone());
        lookup.start();
        lookup.on_response(&initial[0], Vec::new(), Vec::new(), Some(b"tok".to_vec()));

        assert!(lookup.announce_targets().is_empty());
    }
}
