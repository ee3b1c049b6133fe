//! Bookkeeping for in-flight queries.
//!
//! Every outgoing query is registered here before it hits the socket. An
//! incoming response or error settles the transaction only when both the
//! transaction id and the source address match what was registered, and each
//! transaction settles at most once. Unanswered transactions are retried once
//! and then expired by the periodic sweep.

use crate::routing::node::NodeHandle;
use rand::Rng;
use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    net::SocketAddr,
    time::{Duration, Instant},
};

/// How long to wait for a response before retrying or expiring a query.
pub(crate) const MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often unanswered transactions are swept.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Resends of a query before the transaction is given up on.
const RETRY_BUDGET: u8 = 1;

/// Two byte transaction id carried in the `t` field of a query and echoed
/// back by the responder.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct TransactionId(u16);

impl TransactionId {
    pub fn to_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    pub fn from_bytes(raw: &[u8]) -> Option<Self> {
        Some(Self(u16::from_be_bytes(raw.try_into().ok()?)))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Which task an in-flight query belongs to, so its response or timeout can
/// be routed back to it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum Origin {
    /// Standalone liveness check, no task waits on it.
    Ping,
    /// Part of an iterative lookup (bootstrap, refresh or peer search).
    Lookup(LookupId),
}

/// Identifies one iterative lookup task.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct LookupId(pub u64);

pub(crate) struct PendingTransaction {
    pub target: NodeHandle,
    /// The encoded query, kept around so a retry reuses the same bytes (and
    /// thus the same transaction id).
    pub message: Vec<u8>,
    pub origin: Origin,
    issued_at: Instant,
    retries_left: u8,
}

/// Set of unsettled transactions keyed by transaction id.
pub(crate) struct TransactionSet {
    pending: HashMap<TransactionId, PendingTransaction>,
    timeout: Duration,
    next_id: u16,
}

impl TransactionSet {
    pub fn new<R: Rng>(timeout: Duration, rng: &mut R) -> Self {
        Self {
            pending: HashMap::new(),
            timeout,
            // Random starting point so ids do not repeat across restarts.
            next_id: rng.gen(),
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Pick an id not currently in flight.
    pub fn next_id(&mut self) -> TransactionId {
        loop {
            let id = TransactionId(self.next_id);
            self.next_id = self.next_id.wrapping_add(1);

            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a query. Must happen before the query is sent so a fast
    /// response cannot race the registration.
    pub fn insert(
        &mut self,
        id: TransactionId,
        target: NodeHandle,
        message: Vec<u8>,
        origin: Origin,
    ) {
        match self.pending.entry(id) {
            Entry::Vacant(entry) => {
                entry.insert(PendingTransaction {
                    target,
                    message,
                    origin,
                    issued_at: Instant::now(),
                    retries_left: RETRY_BUDGET,
                });
            }
            Entry::Occupied(_) => unreachable!("transaction id already in flight"),
        }
    }

    /// Settle the transaction matching the raw id and the datagram's source
    /// address. Returns `None` for unknown ids, already settled transactions
    /// and id matches from the wrong address, in which case the original
    /// transaction stays pending.
    pub fn resolve(&mut self, raw_id: &[u8], from: SocketAddr) -> Option<PendingTransaction> {
        let id = TransactionId::from_bytes(raw_id)?;

        match self.pending.entry(id) {
            Entry::Occupied(entry) if entry.get().target.addr == from => Some(entry.remove()),
            Entry::Occupied(_) | Entry::Vacant(_) => None,
        }
    }

    /// Collect transactions whose timeout elapsed. Ones with retry budget
    /// left are re-armed and returned for resending, the rest are expired
    /// and removed.
    pub fn sweep(&mut self) -> Sweep {
        let now = Instant::now();
        let timeout = self.timeout;

        let mut retries = Vec::new();
        let mut expired = Vec::new();

        self.pending.retain(|id, transaction| {
            if now.saturating_duration_since(transaction.issued_at) < timeout {
                return true;
            }

            if transaction.retries_left > 0 {
                transaction.retries_left -= 1;
                transaction.issued_at = now;
                retries.push((*id, transaction.target, transaction.message.clone()));
                true
            } else {
                expired.push((transaction.target, transaction.origin));
                false
            }
        });

        Sweep { retries, expired }
    }
}

pub(crate) struct Sweep {
    /// Queries to resend verbatim.
    pub retries: Vec<(TransactionId, NodeHandle, Vec<u8>)>,
    /// Transactions given up on. These count as failures against the target
    /// node and as unanswered queries towards their owning task.
    pub expired: Vec<(NodeHandle, Origin)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;
    use std::net::Ipv4Addr;

    fn dummy_target() -> NodeHandle {
        NodeHandle::new(test::dummy_node_id(), test::dummy_socket_addr_v4())
    }

    #[test]
    fn positive_resolve_exactly_once() {
        let mut set = TransactionSet::new(MESSAGE_TIMEOUT, &mut rand::thread_rng());
        let target = dummy_target();

        let id = set.next_id();
        set.insert(id, target, b"ping".to_vec(), Origin::Ping);

        assert!(set.resolve(&id.to_bytes(), target.addr).is_some());
        assert!(set.resolve(&id.to_bytes(), target.addr).is_none());
    }

    #[test]
    fn negative_resolve_from_wrong_address() {
        let mut set = TransactionSet::new(MESSAGE_TIMEOUT, &mut rand::thread_rng());
        let target = dummy_target();

        let id = set.next_id();
        set.insert(id, target, b"ping".to_vec(), Origin::Ping);

        let impostor = (Ipv4Addr::new(127, 0, 0, 99), 6881).into();
        assert!(set.resolve(&id.to_bytes(), impostor).is_none());

        // The transaction is still pending for the real responder.
        assert!(set.resolve(&id.to_bytes(), target.addr).is_some());
    }

    #[test]
    fn negative_resolve_unknown_id() {
        let mut set = TransactionSet::new(MESSAGE_TIMEOUT, &mut rand::thread_rng());

        assert!(set.resolve(&[0x12, 0x34], dummy_target().addr).is_none());
        assert!(set.resolve(b"xyz", dummy_target().addr).is_none());
    }

    #[test]
    fn positive_ids_unique_while_pending() {
        let mut set = TransactionSet::new(MESSAGE_TIMEOUT, &mut rand::thread_rng());
        let target = dummy_target();

        let first = set.next_id();
        set.insert(first, target, b"a".to_vec(), Origin::Ping);
        let second = set.next_id();

        assert_ne!(first, second);
    }

    #[test]
    fn positive_sweep_retries_then_expires() {
        let mut set = TransactionSet::new(Duration::ZERO, &mut rand::thread_rng());
        let target = dummy_target();

        let id = set.next_id();
        set.insert(id, target, b"ping".to_vec(), Origin::Ping);

        // First sweep spends the retry budget.
        let sweep = set.sweep();
        assert_eq!(sweep.retries.len(), 1);
        assert_eq!(sweep.retries[0].0, id);
        assert!(sweep.expired.is_empty());
        assert_eq!(set.len(), 1);

        // Second sweep expires the transaction.
        let sweep = set.sweep();
        assert!(sweep.retries.is_empty());
        assert_eq!(sweep.expired.len(), 1);
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn negative_sweep_leaves_fresh_transactions() {
        let mut set = TransactionSet::new(MESSAGE_TIMEOUT, &mut rand::thread_rng());
        let target = dummy_target();

        let id = set.next_id();
        set.insert(id, target, b"ping".to_vec(), Origin::Ping);

        let sweep = set.sweep();
        assert!(sweep.retries.is_empty());
        assert!(sweep.expired.is_empty());
        assert_eq!(set.len(), 1);
    }
}
