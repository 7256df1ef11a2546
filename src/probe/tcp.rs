//! TCP SYN probe building and parsing for traceroute
//!
//! SYN segments trigger ICMP Time Exceeded from intermediate routers and a
//! SYN-ACK or RST from the destination. The probe sequence number is carried
//! in the TCP sequence field, so the destination's acknowledgment number is
//! the sequence plus one.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::probe::checksum::pseudo_header_checksum;

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// Size of a TCP header without options
pub const TCP_HEADER_SIZE: usize = 20;

const TCP_WINDOW: u16 = 8192;

/// TCP flags
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_ACK: u8 = 0x10;

/// Build a TCP SYN header carrying `sequence` in the sequence number field.
/// The checksum covers the pseudo-header of `src_ip` and `dst_ip`.
pub fn build_tcp_syn(
    src_port: u16,
    dst_port: u16,
    sequence: u32,
    src_ip: IpAddr,
    dst_ip: IpAddr,
) -> Vec<u8> {
    let mut packet = vec![0u8; TCP_HEADER_SIZE];

    packet[0..2].copy_from_slice(&src_port.to_be_bytes());
    packet[2..4].copy_from_slice(&dst_port.to_be_bytes());
    packet[4..8].copy_from_slice(&sequence.to_be_bytes());
    // Acknowledgment number stays 0 for SYN

    // Data offset = 5 (20 bytes / 4)
    packet[12] = 0x50;
    packet[13] = TCP_FLAG_SYN;
    packet[14..16].copy_from_slice(&TCP_WINDOW.to_be_bytes());

    let checksum = pseudo_header_checksum(src_ip, dst_ip, IPPROTO_TCP, &packet);
    packet[16..18].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// The fields of a TCP header that matter for reply matching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub sequence: u32,
    pub ack: u32,
    pub flags: u8,
}

impl TcpSegment {
    pub fn is_syn_ack(&self) -> bool {
        self.flags & (TCP_FLAG_SYN | TCP_FLAG_ACK) == TCP_FLAG_SYN | TCP_FLAG_ACK
    }

    pub fn is_reset(&self) -> bool {
        self.flags & TCP_FLAG_RST != 0
    }
}

/// Parse a TCP header. Quoted headers in ICMP errors may be cut after
/// 8 bytes, in which case `ack` and `flags` read as zero.
pub fn parse_tcp_segment(data: &[u8]) -> Option<TcpSegment> {
    if data.len() < 8 {
        return None;
    }

    let (ack, flags) = if data.len() >= 14 {
        (
            u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data[13],
        )
    } else {
        (0, 0)
    };

    Some(TcpSegment {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack,
        flags,
    })
}

/// Create a header-included raw socket for sending SYN datagrams.
/// IPPROTO_RAW implies IP_HDRINCL for both families. Requires CAP_NET_RAW.
pub fn create_tcp_send_socket(ipv6: bool) -> io::Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    Socket::new(domain, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))
}

/// Create a raw TCP socket that sees SYN-ACK/RST replies from the destination
pub fn create_tcp_recv_socket(ipv6: bool) -> io::Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::RAW, Some(Protocol::TCP))?;
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    Ok(socket)
}

/// Get the source IP address for checksum calculation.
/// Uses the UDP connect trick to find the local IP that routes to target.
pub fn local_addr_for(target: IpAddr) -> IpAddr {
    use std::net::UdpSocket;

    let bind_addr = match target {
        IpAddr::V4(_) => "0.0.0.0:0",
        IpAddr::V6(_) => "[::]:0",
    };

    // No packet leaves the host for a UDP connect
    let target_addr = std::net::SocketAddr::new(target, 80);

    if let Ok(socket) = UdpSocket::bind(bind_addr)
        && socket.connect(target_addr).is_ok()
        && let Ok(local_addr) = socket.local_addr()
    {
        return local_addr.ip();
    }

    match target {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
