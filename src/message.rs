//! KRPC message codec: bencoded query/response/error datagrams, each
//! correlated by a transaction id chosen by the querying side.

use crate::{
    compact,
    id::{InfoHash, NodeId},
    routing::node::NodeHandle,
};
use serde::{
    de::{Deserializer, Error as _, IgnoredAny, SeqAccess, Visitor},
    ser::{SerializeSeq, Serializer},
    Deserialize, Serialize,
};
use std::{fmt, net::SocketAddr};

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct Message {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    pub fn decode(input: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(input)
    }

    pub fn encode(&self) -> Vec<u8> {
        // Serializing into a Vec only fails on a bug in our own serde impls.
        serde_bencode::to_bytes(self).expect("failed to serialize message")
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "y")]
pub(crate) enum MessageBody {
    #[serde(rename = "q")]
    Query(Query),
    #[serde(rename = "r", with = "nested::response")]
    Response(Response),
    #[serde(rename = "e", with = "nested::error")]
    Error(ErrorMessage),
}

// The "r" and "e" payloads live one dict level deeper than serde's adjacent
// tagging produces, so wrap them in an artificial single-field struct.
mod nested {
    macro_rules! impl_nested {
        ($mod:ident, $field:literal) => {
            pub(crate) mod $mod {
                use serde::{Deserialize, Deserializer, Serialize, Serializer};

                #[derive(Serialize, Deserialize)]
                struct Wrapper<T> {
                    #[serde(rename = $field)]
                    inner: T,
                }

                pub(crate) fn serialize<T: Serialize, S: Serializer>(
                    value: &T,
                    s: S,
                ) -> Result<S::Ok, S::Error> {
                    Wrapper { inner: value }.serialize(s)
                }

                pub(crate) fn deserialize<'de, T: Deserialize<'de>, D: Deserializer<'de>>(
                    d: D,
                ) -> Result<T, D::Error> {
                    Ok(Wrapper::deserialize(d)?.inner)
                }
            }
        };
    }

    impl_nested!(response, "r");
    impl_nested!(error, "e");
}

/// The four supported query kinds.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "q", content = "a")]
#[serde(rename_all = "snake_case")]
pub(crate) enum Query {
    Ping(PingQuery),
    FindNode(FindNodeQuery),
    GetPeers(GetPeersQuery),
    AnnouncePeer(AnnouncePeerQuery),
}

impl Query {
    /// Id the remote node claims for itself.
    pub fn sender_id(&self) -> NodeId {
        match self {
            Self::Ping(q) => q.id,
            Self::FindNode(q) => q.id,
            Self::GetPeers(q) => q.id,
            Self::AnnouncePeer(q) => q.id,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct PingQuery {
    pub id: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct FindNodeQuery {
    pub id: NodeId,
    pub target: NodeId,

    #[serde(with = "want", default, skip_serializing_if = "Option::is_none")]
    pub want: Option<Want>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct GetPeersQuery {
    pub id: NodeId,
    pub info_hash: InfoHash,

    #[serde(with = "want", default, skip_serializing_if = "Option::is_none")]
    pub want: Option<Want>,
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct AnnouncePeerQuery {
    pub id: NodeId,
    pub info_hash: InfoHash,
    #[serde(with = "port", flatten)]
    pub port: Option<u16>,
    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

/// BEP32 address-family selector.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum Want {
    V4,
    V6,
    Both,
}

mod want {
    use super::Want;
    use serde::{
        de::{SeqAccess, Visitor},
        ser::SerializeSeq,
        Deserializer, Serializer,
    };
    use serde_bytes::Bytes;
    use std::fmt;

    pub(super) fn serialize<S: Serializer>(want: &Option<Want>, s: S) -> Result<S::Ok, S::Error> {
        let len = match want {
            None => 0,
            Some(Want::V4 | Want::V6) => 1,
            Some(Want::Both) => 2,
        };

        let mut seq = s.serialize_seq(Some(len))?;

        if matches!(want, Some(Want::V4 | Want::Both)) {
            seq.serialize_element(Bytes::new(b"n4"))?;
        }
        if matches!(want, Some(Want::V6 | Want::Both)) {
            seq.serialize_element(Bytes::new(b"n6"))?;
        }

        seq.end()
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<Want>, D::Error> {
        struct WantVisitor;

        impl<'de> Visitor<'de> for WantVisitor {
            type Value = Option<Want>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a list of strings")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut value = None;

                while let Some(s) = seq.next_element::<String>()? {
                    value = match (value, s.as_str().trim()) {
                        (None, "n4" | "N4") => Some(Want::V4),
                        (None, "n6" | "N6") => Some(Want::V6),
                        (Some(Want::V4), "n6" | "N6") => Some(Want::Both),
                        (Some(Want::V6), "n4" | "N4") => Some(Want::Both),
                        (_, _) => value,
                    }
                }

                Ok(value)
            }
        }

        d.deserialize_seq(WantVisitor)
    }
}

// announce_peer carries either an explicit port or the "implied_port" flag
// meaning "use the UDP source port".
mod port {
    use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,

        #[serde(
            default,
            skip_serializing_if = "is_false",
            deserialize_with = "deserialize_bool"
        )]
        implied_port: bool,
    }

    pub(crate) fn serialize<S: Serializer>(port: &Option<u16>, s: S) -> Result<S::Ok, S::Error> {
        Wrapper {
            implied_port: port.is_none(),
            port: *port,
        }
        .serialize(s)
    }

    pub(crate) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u16>, D::Error> {
        let wrapper = Wrapper::deserialize(d)?;

        if wrapper.implied_port {
            Ok(None)
        } else if wrapper.port.is_some() {
            Ok(wrapper.port)
        } else {
            Err(D::Error::missing_field("port"))
        }
    }

    fn is_false(b: &bool) -> bool {
        !*b
    }

    fn deserialize_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(d)? > 0)
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Response {
    // Order matters for untagged deserialization: the get_peers response is
    // the only one carrying a token, try it first.
    GetPeers(GetPeersResponse),
    // Response to ping, find_node or announce_peer. Which one it is follows
    // from the transaction the id correlates to.
    NodeList(NodeListResponse),
}

impl Response {
    pub fn sender_id(&self) -> NodeId {
        match self {
            Self::GetPeers(r) => r.id,
            Self::NodeList(r) => r.id,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct NodeListResponse {
    pub id: NodeId,

    #[serde(
        rename = "nodes",
        with = "compact::nodes_v4",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nodes_v4: Vec<NodeHandle>,

    #[serde(
        rename = "nodes6",
        with = "compact::nodes_v6",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nodes_v6: Vec<NodeHandle>,
}

impl NodeListResponse {
    /// Plain acknowledgement without any contacts (ping/announce response).
    pub fn ack(id: NodeId) -> Self {
        Self {
            id,
            nodes_v4: Vec::new(),
            nodes_v6: Vec::new(),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub(crate) struct GetPeersResponse {
    pub id: NodeId,

    #[serde(
        with = "compact::values",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub values: Vec<SocketAddr>,

    #[serde(
        rename = "nodes",
        with = "compact::nodes_v4",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nodes_v4: Vec<NodeHandle>,

    #[serde(
        rename = "nodes6",
        with = "compact::nodes_v6",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub nodes_v6: Vec<NodeHandle>,

    #[serde(with = "serde_bytes")]
    pub token: Vec<u8>,
}

/// KRPC error payload, a `[code, message]` pair on the wire.
#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct ErrorMessage {
    pub code: u8,
    pub message: String,
}

impl Serialize for ErrorMessage {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let mut seq = s.serialize_seq(Some(2))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(&self.message)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for ErrorMessage {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        struct ErrorVisitor;

        impl<'de> Visitor<'de> for ErrorVisitor {
            type Value = ErrorMessage;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "a list of two elements: an integer and a string")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let code: u8 = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(0, &self))?;
                let message = seq
                    .next_element()?
                    .ok_or_else(|| A::Error::invalid_length(1, &self))?;

                if seq.next_element::<IgnoredAny>()?.is_some() {
                    return Err(A::Error::invalid_length(3, &self));
                }

                Ok(ErrorMessage { code, message })
            }
        }

        d.deserialize_seq(ErrorVisitor)
    }
}

pub(crate) mod error_code {
    #![allow(unused)]

    pub const GENERIC_ERROR: u8 = 201;
    pub const SERVER_ERROR: u8 = 202;
    pub const PROTOCOL_ERROR: u8 = 203;
    pub const METHOD_UNKNOWN: u8 = 204;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn serialize_ping_query() {
        let encoded = "d1:ad2:id20:abcdefghij0123456789e1:q4:ping1:t2:aa1:y1:qe";
        let decoded = Message {
            transaction_id: b"aa".to_vec(),
            body: MessageBody::Query(Query::Ping(PingQuery {
                id: NodeId::from(*b"abcdefghij0123456789"),
            })),
        };

        assert_codec(encoded, &decoded);
    }

    #[test]
    fn serialize_find_node_query() {
        let encoded = "d1:ad2:id20:abcdefghij01234567896:target20:mnopqrstuvwxyz123456e1:q9:find_node1:t2:aa1:y1:qe";
        let decoded = Message {
            transaction_id: b"aa".to_vec(),
            body: MessageBody::Query(Query::FindNode(FindNodeQuery {
                id: NodeId::from(*b"abcdefghij0123456789"),
                target: NodeId::from(*b"mnopqrstuvwxyz123456"),
                want: None,
            })),
        };

        assert_codec(encoded, &decoded);
    }

    #[test]
    fn serialize_find_node_query_with_want() {
        let encoded = "d1:ad2:id20:abcdefghij01234567896:target20:mnopqrstuvwxyz1234564:wantl2:n42:n6ee1:q9:find_node1:t2:aa1:y1:qe";
        let decoded = Message {
            transaction_id: b"aa".to_vec(),
            body: MessageBody::Query(Query::FindNode(FindNodeQuery {
                id: NodeId::from(*b"abcdefghij0123456789"),
                target: NodeId::from(*b"mnopqrstuvwxyz123456"),
                want: Some(Want::Both),
            })),
        };

        assert_codec(encoded, &decoded);
    }

    #[test]
    fn serialize_announce_peer_query_implied_port() {
        let encoded = "d1:ad2:id20:abcdefghij012345678912:implied_porti1e9:info_hash20:mnopqrstuvwxyz1234565:token8:aoeusnthe1:q13:announce_peer1:t2:aa1:y1:qe";
        let decoded = Message {
            transaction_id: b"aa".to_vec(),
            body: MessageBody::Query(Query::AnnouncePeer(AnnouncePeerQuery {
                id: NodeId::from(*b"abcdefghij0123456789"),
                port: None,
                info_hash: InfoHash::from(*b"mnopqrstuvwxyz123456"),
                token: b"aoeusnth".to_vec(),
            })),
        };

        assert_codec(encoded, &decoded);
    }

    #[test]
    fn serialize_announce_peer_query_explicit_port() {
        let encoded = "d1:ad2:id20:abcdefghij01234567899:info_hash20:mnopqrstuvwxyz1234564:porti6881e5:token8:aoeusnthe1:q13:announce_peer1:t2:aa1:y1:qe";
        let decoded = Message {
            transaction_id: b"aa".to_vec(),
            body: MessageBody::Query(Query::AnnouncePeer(AnnouncePeerQuery {
                id: NodeId::from(*b"abcdefghij0123456789"),
                port: Some(6881),
                info_hash: InfoHash::from(*b"mnopqrstuvwxyz123456"),
                token: b"aoeusnth".to_vec(),
            })),
        };

        assert_codec(encoded, &decoded);
    }

    #[test]
    fn serialize_node_list_response() {
        let encoded =
            "d1:rd2:id20:0123456789abcdefghij5:nodes26:mnopqrstuvwxyz012345axje.ue1:t2:aa1:y1:re";
        let decoded = Message {
            transaction_id: b"aa".to_vec(),
            body: MessageBody::Response(Response::NodeList(NodeListResponse {
                id: NodeId::from(*b"0123456789abcdefghij"),
                nodes_v4: vec![NodeHandle {
                    id: NodeId::from(*b"mnopqrstuvwxyz012345"),
                    addr: (Ipv4Addr::new(97, 120, 106, 101), 11893).into(),
                }],
                nodes_v6: vec![],
            })),
        };

        assert_codec(encoded, &decoded);
    }

    #[test]
    fn serialize_node_list_response_v6() {
        let encoded =
            "d1:rd2:id20:0123456789abcdefghij6:nodes638:mnopqrstuvwxyz012345abcdefghijklmnop.ue1:t2:aa1:y1:re";
        let decoded = Message {
            transaction_id: b"aa".to_vec(),
            body: MessageBody::Response(Response::NodeList(NodeListResponse {
                id: NodeId::from(*b"0123456789abcdefghij"),
                nodes_v4: vec![],
                nodes_v6: vec![NodeHandle {
                    id: NodeId::from(*b"mnopqrstuvwxyz012345"),
                    addr: (
                        Ipv6Addr::new(
                            0x6162, 0x6364, 0x6566, 0x6768, 0x696a, 0x6b6c, 0x6d6e, 0x6f70,
                        ),
                        11893,
                    )
                        .into(),
                }],
            })),
        };

        assert_codec(encoded, &decoded);
    }

    #[test]
    fn serialize_get_peers_response_with_values() {
        let encoded = "d1:rd2:id20:abcdefghij01234567895:token8:aoeusnth6:valuesl6:axje.u6:idhtnmee1:t2:aa1:y1:re";
        let decoded = Message {
            transaction_id: b"aa".to_vec(),
            body: MessageBody::Response(Response::GetPeers(GetPeersResponse {
                id: NodeId::from(*b"abcdefghij0123456789"),
                values: vec![
                    (Ipv4Addr::new(97, 120, 106, 101), 11893).into(),
                    (Ipv4Addr::new(105, 100, 104, 116), 28269).into(),
                ],
                nodes_v4: vec![],
                nodes_v6: vec![],
                token: b"aoeusnth".to_vec(),
            })),
        };

        assert_codec(encoded, &decoded);
    }

    #[test]
    fn serialize_error_message() {
        let encoded = "d1:eli203e13:invalid tokene1:t2:aa1:y1:ee";
        let decoded = Message {
            transaction_id: b"aa".to_vec(),
            body: MessageBody::Error(ErrorMessage {
                code: error_code::PROTOCOL_ERROR,
                message: "invalid token".to_owned(),
            }),
        };

        assert_codec(encoded, &decoded);
    }

    #[test]
    fn negative_garbage_rejected() {
        assert!(Message::decode(b"not bencode at all").is_err());
        assert!(Message::decode(b"d1:t2:aae").is_err());
    }

    #[track_caller]
    fn assert_codec(encoded: &str, decoded: &Message) {
        assert_eq!(serde_bencode::to_string(decoded).unwrap(), encoded);
        assert_eq!(
            serde_bencode::from_str::<Message>(encoded).unwrap(),
            *decoded
        );
    }
}
