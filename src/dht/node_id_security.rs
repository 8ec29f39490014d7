//! IP-restricted node addresses.
//!
//! A node address is "IP-restricted" when its first 21 bits are the CRC32C of
//! the node's masked external IP mixed with a 3-bit nonce stored in the last
//! byte (the BEP-42 scheme). A node cannot choose an arbitrary address near a
//! target without also controlling a matching IP, which makes clustering
//! attacks around a swarm target expensive.
//!
//! Swarm bookkeeping records whether a contact's address verifies against the
//! IP it was observed from; verified contacts replace unverified duplicates,
//! and verified reply sources carry more weight in public-IP voting.
//!
//! [BEP-42]: http://bittorrent.org/beps/bep_0042.html

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::Rng;

use super::address::NodeAddress;

/// IPv4 mask applied before hashing.
pub const IPV4_MASK: u32 = 0x030f3fff;

/// IPv6 mask applied to the high 64 bits before hashing.
pub const IPV6_MASK: u64 = 0x0103070f1f3f7fff;

/// Generates an address restricted to `ip`.
///
/// Local-network IPs are exempt from the restriction and get a random address.
pub fn generate_restricted_address(ip: IpAddr) -> NodeAddress {
    if is_local_network(&ip) {
        return NodeAddress::generate();
    }

    let r: u8 = rand::rng().random::<u8>() & 0x07;
    let crc = compute_ip_crc(ip, r);

    let mut id = [0u8; 20];
    rand::rng().fill(&mut id);

    id[0] = (crc >> 24) as u8;
    id[1] = (crc >> 16) as u8;
    id[2] = (id[2] & 0x07) | ((crc >> 8) as u8 & 0xf8);
    id[19] = r;

    NodeAddress(id)
}

/// Returns true if `address` is restricted to `ip` (always true for local IPs).
pub fn is_ip_restricted(address: &NodeAddress, ip: IpAddr) -> bool {
    if is_local_network(&ip) {
        return true;
    }

    let r = address.0[19] & 0x07;
    let expected_crc = compute_ip_crc(ip, r);

    let actual_bits = ((address.0[0] as u32) << 24)
        | ((address.0[1] as u32) << 16)
        | ((address.0[2] as u32) << 8);

    actual_bits & 0xfffff800 == expected_crc & 0xfffff800
}

fn compute_ip_crc(ip: IpAddr, r: u8) -> u32 {
    match ip {
        IpAddr::V4(ipv4) => {
            let masked = (u32::from(ipv4) & IPV4_MASK) | ((r as u32) << 29);
            crc32c::crc32c(&masked.to_be_bytes())
        }
        IpAddr::V6(ipv6) => {
            let octets = ipv6.octets();
            let mut high = [0u8; 8];
            high.copy_from_slice(&octets[..8]);
            let masked = (u64::from_be_bytes(high) & IPV6_MASK) | ((r as u64) << 61);
            crc32c::crc32c(&masked.to_be_bytes())
        }
    }
}

/// Checks if an IP address is in a local/private network range.
///
/// - IPv4: 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, 169.254.0.0/16, 127.0.0.0/8
/// - IPv6: loopback, link-local, unique local (fc00::/7)
pub fn is_local_network(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => is_local_ipv4(ipv4),
        IpAddr::V6(ipv6) => is_local_ipv6(ipv6),
    }
}

fn is_local_ipv4(ip: &Ipv4Addr) -> bool {
    let o = ip.octets();
    o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254)
        || o[0] == 127
}

fn is_local_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    let segments = ip.segments();
    // fe80::/10
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    // fc00::/7
    segments[0] & 0xfe00 == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_ipv4_detection() {
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(172, 31, 255, 255))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(169, 254, 0, 1))));
        assert!(is_local_network(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));

        assert!(!is_local_network(&IpAddr::V4(Ipv4Addr::new(172, 32, 0, 1))));
        assert!(!is_local_network(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn test_local_ipv6_detection() {
        assert!(is_local_network(&IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_local_network(&IpAddr::V6(Ipv6Addr::new(
            0xfe80, 0, 0, 0, 0, 0, 0, 1
        ))));
        assert!(is_local_network(&IpAddr::V6(Ipv6Addr::new(
            0xfd00, 0, 0, 0, 0, 0, 0, 1
        ))));
        assert!(!is_local_network(&IpAddr::V6(Ipv6Addr::new(
            0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888
        ))));
    }

    #[test]
    fn test_restricted_address_verifies() {
        let ip = IpAddr::V4(Ipv4Addr::new(124, 31, 75, 21));
        let address = generate_restricted_address(ip);
        assert!(is_ip_restricted(&address, ip));
        assert!(!is_ip_restricted(
            &address,
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))
        ));
    }

    #[test]
    fn test_restricted_address_v6() {
        let ip = IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888));
        let address = generate_restricted_address(ip);
        assert!(is_ip_restricted(&address, ip));
    }

    #[test]
    fn test_local_network_always_verified() {
        let random = NodeAddress::generate();
        assert!(is_ip_restricted(
            &random,
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))
        ));
    }
}
