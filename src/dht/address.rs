use super::error::DhtError;
use crate::constants::ADDRESS_LEN;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Number of bits in a node address.
pub const ADDRESS_BITS: u32 = (ADDRESS_LEN * 8) as u32;

/// A 160-bit node identifier.
///
/// Addresses are ordered by plain byte comparison; closeness is always the
/// XOR metric.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NodeAddress(pub [u8; ADDRESS_LEN]);

impl NodeAddress {
    pub const ZERO: NodeAddress = NodeAddress([0u8; ADDRESS_LEN]);

    pub fn generate() -> Self {
        let mut id = [0u8; ADDRESS_LEN];
        rand::rng().fill(&mut id);
        Self(id)
    }

    /// Derives an address from content, e.g. a swarm name.
    pub fn from_content(content: &[u8]) -> Self {
        let digest = Sha1::digest(content);
        let mut id = [0u8; ADDRESS_LEN];
        id.copy_from_slice(&digest);
        Self(id)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DhtError> {
        if bytes.len() != ADDRESS_LEN {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; ADDRESS_LEN];
        id.copy_from_slice(bytes);
        Ok(Self(id))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// XOR distance as an address, so distances compare with `Ord`.
    pub fn distance(&self, other: &NodeAddress) -> NodeAddress {
        let mut dist = [0u8; ADDRESS_LEN];
        for (i, d) in dist.iter_mut().enumerate() {
            *d = self.0[i] ^ other.0[i];
        }
        NodeAddress(dist)
    }

    /// Number of leading bits shared with `other` (0..=160).
    pub fn bit_match(&self, other: &NodeAddress) -> u32 {
        for (i, (a, b)) in self.0.iter().zip(other.0.iter()).enumerate() {
            let x = a ^ b;
            if x != 0 {
                return i as u32 * 8 + x.leading_zeros();
            }
        }
        ADDRESS_BITS
    }

    /// XOR distance in bits: 0 for identical addresses, 160 when the top bit differs.
    pub fn distance_bits(&self, other: &NodeAddress) -> u32 {
        ADDRESS_BITS - self.bit_match(other)
    }

    /// Orders `a` and `b` by their XOR distance to `self`.
    pub fn cmp_distance(&self, a: &NodeAddress, b: &NodeAddress) -> Ordering {
        for i in 0..ADDRESS_LEN {
            let da = a.0[i] ^ self.0[i];
            let db = b.0[i] ^ self.0[i];
            if da != db {
                return da.cmp(&db);
            }
        }
        Ordering::Equal
    }

    /// Clockwise ring offset from `base` to `self` (`self - base` mod 2^160).
    pub fn ring_offset(&self, base: &NodeAddress) -> NodeAddress {
        let mut out = [0u8; ADDRESS_LEN];
        let mut borrow = 0i16;
        for i in (0..ADDRESS_LEN).rev() {
            let mut v = self.0[i] as i16 - base.0[i] as i16 - borrow;
            if v < 0 {
                v += 256;
                borrow = 1;
            } else {
                borrow = 0;
            }
            out[i] = v as u8;
        }
        NodeAddress(out)
    }

    /// Lowest and highest address sharing the first `prefix_bits` bits with `self`.
    pub fn prefix_range(&self, prefix_bits: u32) -> (NodeAddress, NodeAddress) {
        let mut low = self.0;
        let mut high = self.0;
        for bit in prefix_bits.min(ADDRESS_BITS)..ADDRESS_BITS {
            let byte = (bit / 8) as usize;
            let mask = 0x80u8 >> (bit % 8);
            low[byte] &= !mask;
            high[byte] |= mask;
        }
        (NodeAddress(low), NodeAddress(high))
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeAddress({:02x}{:02x}{:02x}..)", self.0[0], self.0[1], self.0[2])
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl FromStr for NodeAddress {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != ADDRESS_LEN * 2 || !s.is_ascii() {
            return Err(DhtError::InvalidNodeId);
        }
        let mut id = [0u8; ADDRESS_LEN];
        for (i, byte) in id.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| DhtError::InvalidNodeId)?;
        }
        Ok(Self(id))
    }
}
