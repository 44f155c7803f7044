//! 160-bit identifiers and the XOR metric.
//!
//! Node IDs and infohashes share the same 160-bit space. Closeness is
//! the XOR of two IDs interpreted as a big-endian unsigned integer;
//! bucket placement derives from the length of the shared bit prefix.

use std::fmt;

use rand::Rng as _;

use crate::error::DhtError;

/// Identifier length in bytes.
pub const ID_LEN: usize = 20;

/// Identifier length in bits.
pub const ID_BITS: u32 = 160;

/// A 160-bit node identifier or infohash.
///
/// Bit 0 is the most significant bit of the first byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_LEN]);

/// XOR distance between two identifiers.
///
/// Ordering is the numeric order of the 160-bit value, so a smaller
/// `Distance` means a closer node.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; ID_LEN]);

impl NodeId {
    /// A uniformly random identifier.
    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id[..]);
        Self(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != ID_LEN {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut d = [0u8; ID_LEN];
        for (i, byte) in d.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(d)
    }

    /// Length of the shared bit prefix with `other`, in `0..=160`.
    pub fn common_prefix(&self, other: &NodeId) -> u32 {
        let mut bits = 0;
        for i in 0..ID_LEN {
            let diff = self.0[i] ^ other.0[i];
            bits += diff.leading_zeros();
            if diff != 0 {
                break;
            }
        }
        bits
    }

    /// Value of bit `index` (0 = most significant).
    pub fn bit(&self, index: u32) -> bool {
        let byte = (index / 8) as usize;
        let mask = 0x80 >> (index % 8);
        self.0[byte] & mask != 0
    }

    /// Copy of this identifier with bit `index` set to one.
    pub fn with_bit(&self, index: u32) -> NodeId {
        let mut id = self.0;
        let byte = (index / 8) as usize;
        id[byte] |= 0x80 >> (index % 8);
        NodeId(id)
    }

    /// A random identifier sharing the first `bits` bits with `self`.
    pub fn random_in_prefix(&self, bits: u32) -> NodeId {
        let mut id = [0u8; ID_LEN];
        rand::rng().fill(&mut id[..]);

        let full = (bits / 8) as usize;
        id[..full].copy_from_slice(&self.0[..full]);
        if bits % 8 != 0 {
            let keep = 0xffu8 << (8 - bits % 8);
            id[full] = (self.0[full] & keep) | (id[full] & !keep);
        }
        NodeId(id)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2])
    }
}
