//! Node identity and the XOR metric
//!
//! Nodes and DHT values share one 256-bit identifier space. Distance between
//! two identifiers is bitwise XOR interpreted big-endian; ordering on
//! distances is lexicographic over the 32 raw bytes. All routing decisions
//! operate on the raw bytes - the 64-hex wire form exists only at the codec
//! boundary.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::errors::DhtError;

/// Number of bytes in a node or key identifier.
pub const ID_BYTES: usize = 32;

/// Number of k-buckets in a routing table (one per distance bit).
pub const ID_BITS: usize = ID_BYTES * 8;

/// 256-bit identifier for a node or a DHT key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; ID_BYTES]);

/// DHT keys live in the same identifier space as nodes.
pub type Key = NodeId;

impl NodeId {
    /// Wrap raw identifier bytes.
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Derive the key for a logical name, e.g. `"metadata:<artifact_id>"`.
    ///
    /// Every string key crossing into the DHT is hashed into the 256-bit
    /// space through this single function.
    pub fn for_name(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Parse the fixed 64-hex-character wire form. Uppercase input is
    /// normalised; anything else is rejected.
    pub fn from_hex(s: &str) -> Result<Self, DhtError> {
        if s.len() != ID_BYTES * 2 {
            return Err(DhtError::InvalidMessage(format!(
                "identifier must be {} hex chars, got {}",
                ID_BYTES * 2,
                s.len()
            )));
        }
        let normalised = s.to_ascii_lowercase();
        let raw = hex::decode(&normalised)
            .map_err(|e| DhtError::InvalidMessage(format!("invalid hex identifier: {}", e)))?;
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }

    /// Lowercase 64-hex wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Raw identifier bytes.
    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; ID_BYTES];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({}..)", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &hex::encode(self.0)[..8])
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        NodeId::from_hex(&s).map_err(|e| D::Error::custom(e.to_string()))
    }
}

/// XOR distance between two identifiers. Orders lexicographically on the
/// big-endian bytes, so `a < b` means "a is closer".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_BYTES]);

impl Distance {
    /// Distance zero (identifier to itself).
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Index of the most significant set bit: 0 = closest possible pair,
    /// 255 = farthest. `None` for the zero distance.
    pub fn msb_index(&self) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            if *byte != 0 {
                let bit_in_byte = 7 - byte.leading_zeros() as usize;
                return Some((ID_BYTES - 1 - i) * 8 + bit_in_byte);
            }
        }
        None
    }
}

impl std::fmt::Debug for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Distance({}..)", &hex::encode(self.0)[..8])
    }
}

/// Bucket index for a peer as seen from `local`: the MSB position of the
/// XOR distance. `None` when the identifiers are equal (self is never
/// bucketed).
pub fn bucket_index(local: &NodeId, peer: &NodeId) -> Option<usize> {
    local.distance(peer).msb_index()
}
