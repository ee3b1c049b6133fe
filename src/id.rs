use rand::{
    distributions::{Distribution, Standard},
    Rng,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{fmt, ops::BitXor};
use thiserror::Error;

/// Length in bytes of a node id (160 bits).
pub const NODE_ID_LEN: usize = 20;

/// Length in bytes of an info hash.
pub const INFO_HASH_LEN: usize = NODE_ID_LEN;

/// 160-bit identifier of a node participating in the DHT.
///
/// Ids are only ever compared through their XOR distance. The derived `Ord`
/// impl compares the raw bytes big-endian which is exactly the "distance as
/// unsigned magnitude" ordering once both sides have been xored against the
/// same target.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct NodeId(#[serde(with = "byte_array")] [u8; NODE_ID_LEN]);

/// Identifier of a shared content item, same shape as a `NodeId`.
pub type InfoHash = NodeId;

impl NodeId {
    /// Create an id by SHA-1 hashing the given bytes.
    pub fn sha1(bytes: &[u8]) -> Self {
        Self(Sha1::digest(bytes).into())
    }

    /// XOR distance between two ids.
    pub fn distance(self, other: NodeId) -> NodeId {
        self ^ other
    }

    /// Number of leading zero bits of the id.
    pub fn leading_zeros(&self) -> u32 {
        let mut bits = 0;

        for byte in self.0 {
            bits += byte.leading_zeros();

            if byte != 0 {
                break;
            }
        }

        bits
    }

    /// Return a copy of the id with the bit at `index` flipped.
    ///
    /// Panics if index is out of bounds.
    pub fn flip_bit(self, index: usize) -> Self {
        let mut bytes = self.0;
        bytes[index / 8] ^= 1 << (7 - index % 8);

        Self(bytes)
    }

    /// Generate a random id that shares exactly `depth` leading bits with
    /// `self`. Used to pick refresh targets inside a bucket's range: the
    /// first `depth` bits are kept, bit `depth` is flipped and everything
    /// after it is randomized.
    pub fn random_at_depth<R: Rng>(self, depth: usize, rng: &mut R) -> Self {
        let depth = depth.min(NODE_ID_LEN * 8 - 1);
        let mut bytes = self.flip_bit(depth).0;

        for index in (depth + 1)..NODE_ID_LEN * 8 {
            if rng.gen::<bool>() {
                bytes[index / 8] ^= 1 << (7 - index % 8);
            }
        }

        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; NODE_ID_LEN]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; NODE_ID_LEN] {
    fn from(id: NodeId) -> [u8; NODE_ID_LEN] {
        id.0
    }
}

#[derive(Debug, Error)]
#[error("invalid node id length")]
pub struct LengthError;

impl<'a> TryFrom<&'a [u8]> for NodeId {
    type Error = LengthError;

    fn try_from(slice: &'a [u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into().map_err(|_| LengthError)?))
    }
}

impl BitXor for NodeId {
    type Output = Self;

    fn bitxor(mut self, rhs: Self) -> Self {
        for (dst, src) in self.0.iter_mut().zip(rhs.0.iter()) {
            *dst ^= *src;
        }

        self
    }
}

impl Distribution<NodeId> for Standard {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> NodeId {
        NodeId(rng.gen())
    }
}

impl fmt::LowerHex for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }

        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self)
    }
}

mod byte_array {
    use super::NODE_ID_LEN;
    use serde::{
        de::{Deserialize, Deserializer, Error},
        ser::{Serialize, Serializer},
    };
    use serde_bytes::{ByteBuf, Bytes};

    pub(super) fn serialize<S: Serializer>(
        bytes: &[u8; NODE_ID_LEN],
        s: S,
    ) -> Result<S::Ok, S::Error> {
        Bytes::new(bytes.as_ref()).serialize(s)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<[u8; NODE_ID_LEN], D::Error> {
        let buf = ByteBuf::deserialize(d)?.into_vec();
        let len = buf.len();

        buf.try_into().map_err(|_| {
            let expected = format!("{}", NODE_ID_LEN);
            D::Error::invalid_length(len, &expected.as_ref())
        })
    }
}
