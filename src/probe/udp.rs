use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::probe::icmp::fill_pattern;

/// UDP protocol number for IPv4/IPv6
pub const IPPROTO_UDP: u8 = 17;

/// Start of the dynamic port range that wrapped ports fold back into
pub const DYNAMIC_PORT_BASE: u16 = 49152;
const DYNAMIC_PORT_SPAN: u32 = 65536 - DYNAMIC_PORT_BASE as u32;

/// Destination port for the `sequence`-th port-based probe (1-based).
///
/// Ports past 65535 wrap into 49152..=65535.
pub fn encode_port(base: u16, sequence: u16) -> u16 {
    let port = base as u32 + sequence as u32 - 1;
    if port > u16::MAX as u32 {
        ((port - DYNAMIC_PORT_BASE as u32) % DYNAMIC_PORT_SPAN + DYNAMIC_PORT_BASE as u32) as u16
    } else {
        port as u16
    }
}

/// Recover the sequence number from a quoted destination port.
///
/// Only sequences within [`port_capacity`] decode unambiguously.
pub fn decode_port(base: u16, port: u16) -> Option<u16> {
    if port >= base {
        return Some(port - base + 1);
    }
    if base > DYNAMIC_PORT_BASE && port >= DYNAMIC_PORT_BASE {
        // First wrap: the unwrapped port was port + span
        let unwrapped = port as u32 + DYNAMIC_PORT_SPAN;
        return Some((unwrapped - base as u32 + 1) as u16);
    }
    None
}

/// Number of sequences that map to distinct ports for a base port
pub fn port_capacity(base: u16) -> u64 {
    65536 - base.min(DYNAMIC_PORT_BASE) as u64
}

/// Build a UDP probe payload of filler bytes
pub fn build_udp_payload(size: usize) -> Vec<u8> {
    let mut payload = vec![0u8; size];
    fill_pattern(&mut payload);
    payload
}

/// Create a DGRAM UDP socket bound to an optional source port and address
pub fn create_udp_socket(
    ipv6: bool,
    src_port: Option<u16>,
    source_ip: Option<IpAddr>,
) -> io::Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

    if src_port.is_some() || source_ip.is_some() {
        let ip = source_ip.unwrap_or(if ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        });
        let bind_addr = SocketAddr::new(ip, src_port.unwrap_or(0));
        socket.bind(&SockAddr::from(bind_addr))?;
    }

    Ok(socket)
}
