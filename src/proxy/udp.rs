//! SOCKS5 UDP request header (RFC 1928 Section 7).
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

use super::socks::{TargetAddr, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};

/// `RSV FRAG ATYP ADDR PORT` for a datagram to `addr:port`.
pub fn encode_header(addr: &TargetAddr, port: u16) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(22);
    header.extend_from_slice(&[0x00, 0x00, 0x00]);
    addr.encode(&mut header)?;
    header.extend_from_slice(&port.to_be_bytes());
    Ok(header)
}

/// Prefix `payload` with the UDP request header.
pub fn wrap(addr: &TargetAddr, port: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let mut packet = encode_header(addr, port)?;
    packet.extend_from_slice(payload);
    Ok(packet)
}

/// Split a relayed datagram into its source address and payload.
///
/// Fragmented datagrams (FRAG != 0) are rejected; callers drop them.
pub fn unwrap(datagram: &[u8]) -> Result<(TargetAddr, u16, &[u8])> {
    if datagram.len() < 4 {
        return Err(Error::socks("UDP datagram shorter than its header"));
    }
    if datagram[2] != 0 {
        return Err(Error::socks(format!(
            "fragmented UDP datagram (frag {})",
            datagram[2]
        )));
    }
    let rest = &datagram[4..];
    let (addr, rest) = match datagram[3] {
        ATYP_IPV4 => {
            let octets: [u8; 4] = rest
                .get(..4)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| Error::socks("truncated IPv4 address in UDP header"))?;
            (TargetAddr::Ip(IpAddr::V4(Ipv4Addr::from(octets))), &rest[4..])
        }
        ATYP_IPV6 => {
            let octets: [u8; 16] = rest
                .get(..16)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| Error::socks("truncated IPv6 address in UDP header"))?;
            (TargetAddr::Ip(IpAddr::V6(Ipv6Addr::from(octets))), &rest[16..])
        }
        ATYP_DOMAIN => {
            let len = *rest
                .first()
                .ok_or_else(|| Error::socks("truncated domain in UDP header"))? as usize;
            let name = rest
                .get(1..1 + len)
                .ok_or_else(|| Error::socks("truncated domain in UDP header"))?;
            (
                TargetAddr::Domain(String::from_utf8_lossy(name).into_owned()),
                &rest[1 + len..],
            )
        }
        other => {
            return Err(Error::socks(format!(
                "unsupported address type {:#x} in UDP header",
                other
            )))
        }
    };
    if rest.len() < 2 {
        return Err(Error::socks("truncated port in UDP header"));
    }
    let port = u16::from_be_bytes([rest[0], rest[1]]);
    Ok((addr, port, &rest[2..]))
}
