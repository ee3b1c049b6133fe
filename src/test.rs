//! Helpers shared by the unit tests.

use crate::id::{NodeId, NODE_ID_LEN};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

pub(crate) fn dummy_node_id() -> NodeId {
    NodeId::from([0xab; NODE_ID_LEN])
}

/// `count` distinct node ids.
pub(crate) fn dummy_block_node_ids(count: u8) -> Vec<NodeId> {
    (0..count)
        .map(|index| {
            let mut bytes = [0xab; NODE_ID_LEN];
            bytes[NODE_ID_LEN - 1] = index;
            NodeId::from(bytes)
        })
        .collect()
}

pub(crate) fn dummy_socket_addr_v4() -> SocketAddr {
    (Ipv4Addr::new(127, 0, 0, 1), 6881).into()
}

pub(crate) fn dummy_socket_addr_v6() -> SocketAddr {
    (Ipv6Addr::LOCALHOST, 6881).into()
}

/// `count` distinct v4 socket addresses.
pub(crate) fn dummy_block_socket_addrs(count: u16) -> Vec<SocketAddr> {
    (0..count)
        .map(|index| (Ipv4Addr::new(127, 0, 0, 1), 10000 + index).into())
        .collect()
}
