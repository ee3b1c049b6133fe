//! Kademlia-style DHT peer discovery engine for bittorrent-like download
//! clients.
//!
//! One [`Dht`] instance serves one address family. It maintains a routing
//! table over the XOR metric, answers the four standard queries (ping,
//! find_node, get_peers, announce_peer), runs iterative lookups to find
//! peers for an info hash and persists its routing state across restarts.

mod builder;
mod compact;
mod dispatch;
mod id;
mod message;
mod routing;
mod snapshot;
mod socket;
mod storage;
#[cfg(test)]
mod test;
mod token;
mod transaction;
mod worker;

pub use crate::{
    builder::{Dht, DhtConfig, PortSelection, SetupError},
    id::{InfoHash, LengthError, NodeId, INFO_HASH_LEN, NODE_ID_LEN},
    snapshot::Snapshot,
    socket::SocketTrait,
    worker::{IpVersion, State},
};
