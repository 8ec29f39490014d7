use super::address::NodeAddress;
use super::error::DhtError;
use crate::constants::{COMPACT_V4_LEN, COMPACT_V6_LEN};
use sha1::{Digest, Sha1};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub const ALL: [AddressFamily; 2] = [AddressFamily::V4, AddressFamily::V6];

    pub fn index(self) -> usize {
        match self {
            AddressFamily::V4 => 0,
            AddressFamily::V6 => 1,
        }
    }

    pub fn compact_len(self) -> usize {
        match self {
            AddressFamily::V4 => COMPACT_V4_LEN,
            AddressFamily::V6 => COMPACT_V6_LEN,
        }
    }

    pub fn of_ip(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("ipv4"),
            AddressFamily::V6 => f.write_str("ipv6"),
        }
    }
}

/// An IPv4 or IPv6 endpoint, or nothing.
///
/// The all-zero compact form (unspecified address, port 0) decodes to
/// [`NetworkAddress::Empty`], which is how optional address fields travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum NetworkAddress {
    #[default]
    Empty,
    V4(SocketAddrV4),
    V6(SocketAddrV6),
}

impl NetworkAddress {
    pub fn is_empty(&self) -> bool {
        matches!(self, NetworkAddress::Empty)
    }

    pub fn family(&self) -> Option<AddressFamily> {
        match self {
            NetworkAddress::Empty => None,
            NetworkAddress::V4(_) => Some(AddressFamily::V4),
            NetworkAddress::V6(_) => Some(AddressFamily::V6),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            NetworkAddress::Empty => None,
            NetworkAddress::V4(a) => Some(IpAddr::V4(*a.ip())),
            NetworkAddress::V6(a) => Some(IpAddr::V6(*a.ip())),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            NetworkAddress::Empty => 0,
            NetworkAddress::V4(a) => a.port(),
            NetworkAddress::V6(a) => a.port(),
        }
    }

    pub fn with_port(&self, port: u16) -> Self {
        match self {
            NetworkAddress::Empty => NetworkAddress::Empty,
            NetworkAddress::V4(a) => NetworkAddress::V4(SocketAddrV4::new(*a.ip(), port)),
            NetworkAddress::V6(a) => {
                NetworkAddress::V6(SocketAddrV6::new(*a.ip(), port, 0, 0))
            }
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            NetworkAddress::Empty => None,
            NetworkAddress::V4(a) => Some(SocketAddr::V4(*a)),
            NetworkAddress::V6(a) => Some(SocketAddr::V6(*a)),
        }
    }

    pub fn same_ip(&self, other: &NetworkAddress) -> bool {
        match (self.ip(), other.ip()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Decodes a 6- or 18-byte compact endpoint.
    pub fn from_compact(data: &[u8]) -> Result<Self, DhtError> {
        match data.len() {
            COMPACT_V4_LEN => {
                let ip = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
                let port = u16::from_be_bytes([data[4], data[5]]);
                if ip.is_unspecified() && port == 0 {
                    return Ok(NetworkAddress::Empty);
                }
                Ok(NetworkAddress::V4(SocketAddrV4::new(ip, port)))
            }
            COMPACT_V6_LEN => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data[..16]);
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([data[16], data[17]]);
                if ip.is_unspecified() && port == 0 {
                    return Ok(NetworkAddress::Empty);
                }
                Ok(NetworkAddress::V6(SocketAddrV6::new(ip, port, 0, 0)))
            }
            n => Err(DhtError::InvalidAddress(format!("compact length {}", n))),
        }
    }

    /// Writes the compact form for `family` into `out`, which must be exactly
    /// `family.compact_len()` long. An empty or mismatched address is written as zeros.
    pub fn write_compact(&self, family: AddressFamily, out: &mut [u8]) {
        out.fill(0);
        match (self, family) {
            (NetworkAddress::V4(a), AddressFamily::V4) => {
                out[..4].copy_from_slice(&a.ip().octets());
                out[4..6].copy_from_slice(&a.port().to_be_bytes());
            }
            (NetworkAddress::V6(a), AddressFamily::V6) => {
                out[..16].copy_from_slice(&a.ip().octets());
                out[16..18].copy_from_slice(&a.port().to_be_bytes());
            }
            _ => {}
        }
    }

    /// Compact form in its own family, for fields whose family follows the value.
    pub fn to_compact(&self) -> Option<CompactAddress> {
        let family = self.family()?;
        let mut out = CompactAddress::new(family);
        self.write_compact(family, out.as_mut_slice());
        Some(out)
    }
}

impl From<SocketAddr> for NetworkAddress {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(a) => NetworkAddress::V4(a),
            SocketAddr::V6(a) => match a.ip().to_ipv4_mapped() {
                Some(v4) => NetworkAddress::V4(SocketAddrV4::new(v4, a.port())),
                None => NetworkAddress::V6(SocketAddrV6::new(*a.ip(), a.port(), 0, 0)),
            },
        }
    }
}

impl FromStr for NetworkAddress {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "-" {
            return Ok(NetworkAddress::Empty);
        }
        s.parse::<SocketAddr>()
            .map(NetworkAddress::from)
            .map_err(|_| DhtError::InvalidAddress(s.to_string()))
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkAddress::Empty => f.write_str("-"),
            NetworkAddress::V4(a) => write!(f, "{}", a),
            NetworkAddress::V6(a) => write!(f, "{}", a),
        }
    }
}

/// A compact endpoint held on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactAddress {
    bytes: [u8; COMPACT_V6_LEN],
    len: usize,
}

impl CompactAddress {
    pub fn new(family: AddressFamily) -> Self {
        Self {
            bytes: [0u8; COMPACT_V6_LEN],
            len: family.compact_len(),
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, DhtError> {
        if data.len() != COMPACT_V4_LEN && data.len() != COMPACT_V6_LEN {
            return Err(DhtError::InvalidAddress(format!(
                "compact length {}",
                data.len()
            )));
        }
        let mut bytes = [0u8; COMPACT_V6_LEN];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            bytes,
            len: data.len(),
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    pub fn family(&self) -> AddressFamily {
        if self.len == COMPACT_V4_LEN {
            AddressFamily::V4
        } else {
            AddressFamily::V6
        }
    }
}

/// Key that cloaks alternate addresses before they are relayed.
///
/// Cloaking XORs the compact bytes with a key derived from the swarm target
/// and, for private swarms, the shared secret; applying it twice restores the
/// original. It hides raw endpoints from casual inspection, nothing more.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CloakKey([u8; 20]);

impl CloakKey {
    pub fn derive(target: &NodeAddress, secret: Option<&[u8; 32]>) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(b"cloak");
        hasher.update(target.as_bytes());
        if let Some(secret) = secret {
            hasher.update(secret);
        }
        let mut key = [0u8; 20];
        key.copy_from_slice(&hasher.finalize());
        Self(key)
    }

    pub fn apply(&self, compact: &mut [u8]) {
        for (i, b) in compact.iter_mut().enumerate() {
            *b ^= self.0[i % self.0.len()];
        }
    }

    pub fn cloak(&self, addr: &NetworkAddress, family: AddressFamily, out: &mut [u8]) {
        addr.write_compact(family, out);
        if !addr.is_empty() {
            self.apply(out);
        }
    }

    pub fn decloak(&self, data: &[u8]) -> Result<NetworkAddress, DhtError> {
        let mut compact = CompactAddress::from_slice(data)?;
        if compact.as_slice().iter().all(|&b| b == 0) {
            return Ok(NetworkAddress::Empty);
        }
        self.apply(compact.as_mut_slice());
        NetworkAddress::from_compact(compact.as_slice())
    }
}

impl fmt::Debug for CloakKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CloakKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_roundtrip_v4() {
        let addr: NetworkAddress = "192.168.1.1:6881".parse().unwrap();
        let compact = addr.to_compact().unwrap();
        assert_eq!(compact.as_slice().len(), 6);
        assert_eq!(NetworkAddress::from_compact(compact.as_slice()).unwrap(), addr);
    }

    #[test]
    fn test_compact_roundtrip_v6() {
        let addr: NetworkAddress = "[2001:4860::8888]:6881".parse().unwrap();
        let compact = addr.to_compact().unwrap();
        assert_eq!(compact.as_slice().len(), 18);
        assert_eq!(NetworkAddress::from_compact(compact.as_slice()).unwrap(), addr);
    }

    #[test]
    fn test_zero_compact_is_empty() {
        assert!(NetworkAddress::from_compact(&[0u8; 6]).unwrap().is_empty());
        assert!(NetworkAddress::from_compact(&[0u8; 18]).unwrap().is_empty());
        assert!(NetworkAddress::from_compact(&[0u8; 7]).is_err());
    }

    #[test]
    fn test_mapped_v6_becomes_v4() {
        let addr: NetworkAddress = "[::ffff:10.0.0.1]:80".parse().unwrap();
        assert_eq!(addr.family(), Some(AddressFamily::V4));
    }

    #[test]
    fn test_cloak_hides_and_restores() {
        let key = CloakKey::derive(&NodeAddress([7u8; 20]), None);
        let addr: NetworkAddress = "10.1.2.3:4000".parse().unwrap();
        let mut out = [0u8; 6];
        key.cloak(&addr, AddressFamily::V4, &mut out);

        let mut plain = [0u8; 6];
        addr.write_compact(AddressFamily::V4, &mut plain);
        assert_ne!(out, plain);
        assert_eq!(key.decloak(&out).unwrap(), addr);

        let mut empty = [0u8; 6];
        key.cloak(&NetworkAddress::Empty, AddressFamily::V4, &mut empty);
        assert!(key.decloak(&empty).unwrap().is_empty());
    }
}
