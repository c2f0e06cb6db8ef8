//! Raw address bytes carried inside messages.
//!
//! Addresses travel as opaque byte strings. Two layouts are understood:
//! - 4 or 16 bytes: a bare IPv4/IPv6 address, combined with a configured port
//! - 6 or 18 bytes: the address followed by a big-endian port
//!
//! We always emit the second layout so peers on non-default ports can be reached.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Encode a socket address as IP octets followed by a big-endian port.
pub fn encode_addr(addr: &SocketAddr) -> Vec<u8> {
    let mut out = match addr.ip() {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    };
    out.extend_from_slice(&addr.port().to_be_bytes());
    out
}

/// Decode raw address bytes, using `default_port` when none is carried.
///
/// Returns `None` for any other length.
pub fn decode_addr(raw: &[u8], default_port: u16) -> Option<SocketAddr> {
    let (ip, port) = match raw.len() {
        4 | 16 => (decode_ip(raw)?, default_port),
        6 | 18 => {
            let (ip, port) = raw.split_at(raw.len() - 2);
            (decode_ip(ip)?, u16::from_be_bytes([port[0], port[1]]))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn decode_ip(raw: &[u8]) -> Option<IpAddr> {
    if let Ok(octets) = <[u8; 4]>::try_from(raw) {
        return Some(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    let octets = <[u8; 16]>::try_from(raw).ok()?;
    Some(IpAddr::V6(Ipv6Addr::from(octets)))
}
