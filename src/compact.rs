//! Compact encodings of peers and node contacts as used on the wire and in
//! the persisted snapshot.

use crate::{id::NODE_ID_LEN, routing::node::NodeHandle};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const ADDR_V4_LEN: usize = 4 + 2;
const ADDR_V6_LEN: usize = 16 + 2;
const CONTACT_V4_LEN: usize = NODE_ID_LEN + ADDR_V4_LEN;
const CONTACT_V6_LEN: usize = NODE_ID_LEN + ADDR_V6_LEN;

fn encode_socket_addr(addr: &SocketAddr) -> Vec<u8> {
    let mut buffer = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    buffer.extend(addr.port().to_be_bytes());
    buffer
}

fn decode_socket_addr(src: &[u8]) -> Option<SocketAddr> {
    let ip: IpAddr = match src.len() {
        ADDR_V4_LEN => {
            let octets: [u8; 4] = src[..4].try_into().ok()?;
            Ipv4Addr::from(octets).into()
        }
        ADDR_V6_LEN => {
            let octets: [u8; 16] = src[..16].try_into().ok()?;
            Ipv6Addr::from(octets).into()
        }
        _ => return None,
    };

    let port = u16::from_be_bytes(src[src.len() - 2..].try_into().ok()?);

    Some(SocketAddr::new(ip, port))
}

/// Serialize/deserialize a `Vec<SocketAddr>` as a bencode list of compact
/// peer byte strings.
pub(crate) mod values {
    use serde::{
        de::{Deserializer, Error as _, SeqAccess, Visitor},
        ser::{SerializeSeq, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};
    use std::{fmt, net::SocketAddr};

    pub(crate) fn serialize<S: Serializer>(
        addrs: &[SocketAddr],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(addrs.len()))?;
        for addr in addrs {
            seq.serialize_element(Bytes::new(&super::encode_socket_addr(addr)))?;
        }
        seq.end()
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Vec<SocketAddr>, D::Error> {
        struct AddrsVisitor;

        impl<'de> Visitor<'de> for AddrsVisitor {
            type Value = Vec<SocketAddr>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "list of compact peer byte strings")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut output = Vec::with_capacity(seq.size_hint().unwrap_or(0));

                while let Some(bytes) = seq.next_element::<ByteBuf>()? {
                    let addr = super::decode_socket_addr(&bytes)
                        .ok_or_else(|| A::Error::invalid_length(bytes.len(), &self))?;
                    output.push(addr);
                }

                Ok(output)
            }
        }

        d.deserialize_seq(AddrsVisitor)
    }
}

macro_rules! impl_compact_nodes {
    ($mod:ident, $contact_len:expr, $is_right_family:expr, $family:literal) => {
        /// Serialize/deserialize a `Vec<NodeHandle>` as one concatenated
        /// compact contact byte string.
        pub(crate) mod $mod {
            use crate::{id::NodeId, routing::node::NodeHandle};
            use serde::{
                de::{Deserialize, Deserializer, Error as _},
                ser::{Error as _, Serializer},
            };
            use serde_bytes::ByteBuf;

            pub(crate) fn serialize<S: Serializer>(
                nodes: &[NodeHandle],
                s: S,
            ) -> Result<S::Ok, S::Error> {
                let mut buffer = Vec::with_capacity(nodes.len() * $contact_len);

                for node in nodes {
                    #[allow(clippy::redundant_closure_call)]
                    if !($is_right_family)(&node.addr) {
                        return Err(S::Error::custom(concat!(
                            "node addr is not ",
                            $family
                        )));
                    }

                    buffer.extend(node.id.as_ref());
                    buffer.extend(super::encode_socket_addr(&node.addr));
                }

                s.serialize_bytes(&buffer)
            }

            pub(crate) fn deserialize<'de, D: Deserializer<'de>>(
                d: D,
            ) -> Result<Vec<NodeHandle>, D::Error> {
                let buffer = ByteBuf::deserialize(d)?;
                let chunks = buffer.chunks_exact($contact_len);

                if !chunks.remainder().is_empty() {
                    let msg = format!("multiple of {}", $contact_len);
                    return Err(D::Error::invalid_length(buffer.len(), &msg.as_ref()));
                }

                Ok(chunks
                    .filter_map(|chunk| {
                        let id = NodeId::try_from(&chunk[..super::NODE_ID_LEN]).ok()?;
                        let addr = super::decode_socket_addr(&chunk[super::NODE_ID_LEN..])?;
                        Some(NodeHandle { id, addr })
                    })
                    .collect())
            }
        }
    };
}

impl_compact_nodes!(nodes_v4, super::CONTACT_V4_LEN, std::net::SocketAddr::is_ipv4, "ipv4");
impl_compact_nodes!(nodes_v6, super::CONTACT_V6_LEN, std::net::SocketAddr::is_ipv6, "ipv6");

/// Split a mixed contact list by address family, for snapshots that store
/// both kinds.
pub(crate) fn split_by_family(nodes: &[NodeHandle]) -> (Vec<NodeHandle>, Vec<NodeHandle>) {
    nodes.iter().copied().partition(|node| node.addr.is_ipv4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn positive_socket_addr_v4_roundtrip() {
        let addr = test::dummy_socket_addr_v4();
        let encoded = encode_socket_addr(&addr);

        assert_eq!(encoded.len(), ADDR_V4_LEN);
        assert_eq!(decode_socket_addr(&encoded), Some(addr));
    }

    #[test]
    fn positive_socket_addr_v6_roundtrip() {
        let addr = test::dummy_socket_addr_v6();
        let encoded = encode_socket_addr(&addr);

        assert_eq!(encoded.len(), ADDR_V6_LEN);
        assert_eq!(decode_socket_addr(&encoded), Some(addr));
    }

    #[test]
    fn negative_truncated_addr_rejected() {
        assert_eq!(decode_socket_addr(&[1, 2, 3]), None);
        assert_eq!(decode_socket_addr(&[0; 7]), None);
    }
}
