//! Decoding of inbound packets into correlation keys.
//!
//! Raw IPv4 ICMP sockets deliver the IP header; raw ICMPv6 sockets deliver
//! the ICMPv6 message only. Raw TCP sockets follow the same split.

use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use std::net::{IpAddr, Ipv6Addr};
use tracing::{debug, trace};

use crate::config::ProbeProtocol;
use crate::probe::checksum::verify_checksum;
use crate::probe::icmp::{ICMP_ECHO_REQUEST, ICMPV6_ECHO_REQUEST};
use crate::probe::ip::IPV6_HEADER_LEN;
use crate::probe::tcp::{IPPROTO_TCP, TCP_HEADER_SIZE, parse_tcp_segment};
use crate::probe::udp::{IPPROTO_UDP, decode_port};
use crate::state::{CorrelationKey, ExtensionObject, IcmpExtensions, MplsLabel, ReplyKind};

// IP protocol numbers
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_ICMPV6: u8 = 58;

// ICMPv6 type codes
const ICMPV6_DEST_UNREACHABLE: u8 = 1;
const ICMPV6_TIME_EXCEEDED: u8 = 3;
const ICMPV6_ECHO_REPLY: u8 = 129;

// IPv6 extension headers that may precede the quoted transport header
const IPV6_NH_HOP_BY_HOP: u8 = 0;
const IPV6_NH_ROUTING: u8 = 43;
const IPV6_NH_FRAGMENT: u8 = 44;
const IPV6_NH_DEST_OPTS: u8 = 60;

// ICMP extension constants (RFC 4884, RFC 4950)
const ICMP_EXT_VERSION: u8 = 2;
const MPLS_LABEL_STACK_CLASS: u8 = 1;
const MPLS_LABEL_STACK_TYPE: u8 = 1;
const MIN_ORIGINAL_DATAGRAM: usize = 128;

/// Session parameters needed to recognise replies to our own probes
#[derive(Debug, Clone)]
pub struct ReplyFilter {
    /// ICMP echo identifier of this session
    pub identifier: u16,
    pub destination: IpAddr,
    /// Source-route gateways; quoted headers of routed probes carry one of
    /// these as destination
    pub route: Vec<IpAddr>,
    /// Destination port base of UDP/TCP probes
    pub base_port: u16,
    /// Source port of TCP probes
    pub tcp_src_port: u16,
}

impl ReplyFilter {
    fn is_probed_destination(&self, addr: IpAddr) -> bool {
        addr == self.destination || self.route.contains(&addr)
    }
}

/// A reply decoded far enough to look up the probe that caused it
#[derive(Debug, Clone)]
pub struct ParsedReply {
    pub key: CorrelationKey,
    /// Per-protocol probe sequence recovered from the reply
    pub sequence: u16,
    pub kind: ReplyKind,
    pub responder: IpAddr,
    /// Destination of the quoted original datagram (the responder itself
    /// for echo and TCP replies)
    pub original_dest: IpAddr,
    /// Acknowledgment number of a TCP reply
    pub tcp_ack: Option<u32>,
    pub extensions: Option<IcmpExtensions>,
}

/// Parse an ICMP/ICMPv6 packet from a raw socket.
///
/// Returns None if the packet is malformed, is not a reply type we track,
/// carries a bad echo checksum, or quotes a datagram that is not ours.
pub fn parse_icmp_reply(data: &[u8], responder: IpAddr, filter: &ReplyFilter) -> Option<ParsedReply> {
    if data.is_empty() {
        return None;
    }

    if responder.is_ipv6() {
        parse_icmpv6(data, responder, filter)
    } else {
        parse_icmp_v4(data, responder, filter)
    }
}

fn parse_icmp_v4(data: &[u8], responder: IpAddr, filter: &ReplyFilter) -> Option<ParsedReply> {
    let ip_packet = Ipv4Packet::new(data)?;
    if ip_packet.get_version() != 4 {
        return None;
    }
    let ip_header_len = (ip_packet.get_header_length() as usize) * 4;

    if ip_header_len < 20 || data.len() < ip_header_len + 8 {
        return None;
    }

    let icmp_data = &data[ip_header_len..];
    let icmp_packet = IcmpPacket::new(icmp_data)?;
    let code = icmp_packet.get_icmp_code().0;

    match icmp_packet.get_icmp_type() {
        IcmpTypes::EchoReply => {
            if !verify_checksum(icmp_data) {
                debug!(%responder, "dropping echo reply with bad checksum");
                return None;
            }
            parse_echo_reply(icmp_data, responder, filter)
        }
        IcmpTypes::TimeExceeded => {
            parse_error_v4(icmp_data, responder, filter, ReplyKind::TimeExceeded(code))
        }
        IcmpTypes::DestinationUnreachable => {
            parse_error_v4(icmp_data, responder, filter, ReplyKind::DestUnreachable(code))
        }
        other => {
            trace!(%responder, icmp_type = other.0, "ignoring ICMP type");
            None
        }
    }
}

fn parse_icmpv6(icmp_data: &[u8], responder: IpAddr, filter: &ReplyFilter) -> Option<ParsedReply> {
    if icmp_data.len() < 8 {
        return None;
    }

    let code = icmp_data[1];
    match icmp_data[0] {
        // The kernel verifies ICMPv6 checksums before delivery
        ICMPV6_ECHO_REPLY => parse_echo_reply(icmp_data, responder, filter),
        ICMPV6_TIME_EXCEEDED => {
            parse_error_v6(icmp_data, responder, filter, ReplyKind::TimeExceeded(code))
        }
        ICMPV6_DEST_UNREACHABLE => {
            parse_error_v6(icmp_data, responder, filter, ReplyKind::DestUnreachable(code))
        }
        other => {
            trace!(%responder, icmp_type = other, "ignoring ICMPv6 type");
            None
        }
    }
}

fn parse_echo_reply(icmp_data: &[u8], responder: IpAddr, filter: &ReplyFilter) -> Option<ParsedReply> {
    let identifier = u16::from_be_bytes([icmp_data[4], icmp_data[5]]);
    let sequence = u16::from_be_bytes([icmp_data[6], icmp_data[7]]);

    if identifier != filter.identifier {
        return None;
    }

    Some(ParsedReply {
        key: CorrelationKey::Echo {
            identifier,
            sequence,
        },
        sequence,
        kind: ReplyKind::EchoReply,
        responder,
        // For Echo Reply, responder IS the target
        original_dest: responder,
        tcp_ack: None,
        extensions: None,
    })
}

/// Parse the payload of an IPv4 ICMP error message
fn parse_error_v4(
    icmp_data: &[u8],
    responder: IpAddr,
    filter: &ReplyFilter,
    kind: ReplyKind,
) -> Option<ParsedReply> {
    // ICMP error format (RFC 4884):
    // [0]    Type
    // [1]    Code
    // [2-3]  Checksum
    // [4]    Unused
    // [5]    Length (original datagram length in 32-bit words, 0 = legacy)
    // [6-7]  Unused
    // [8..]  Original IP header + first bytes of original payload
    if icmp_data.len() < 8 + 20 + 8 {
        return None;
    }

    let original_ip_data = &icmp_data[8..];
    let original_ip = Ipv4Packet::new(original_ip_data)?;
    let orig_ihl = (original_ip.get_header_length() as usize) * 4;
    if orig_ihl < 20 || original_ip_data.len() < orig_ihl + 8 {
        return None;
    }

    let original_dest = IpAddr::V4(original_ip.get_destination());
    if !filter.is_probed_destination(original_dest) {
        debug!(%responder, %original_dest, "quoted destination is not ours");
        return None;
    }

    let (key, sequence) = parse_quoted_transport(
        original_ip.get_next_level_protocol().0,
        &original_ip_data[orig_ihl..],
        ICMP_ECHO_REQUEST,
        filter,
    )?;

    let extensions = parse_icmp_extensions(original_ip_data, icmp_data[5] as usize * 4);

    Some(ParsedReply {
        key,
        sequence,
        kind,
        responder,
        original_dest,
        tcp_ack: None,
        extensions,
    })
}

/// Parse the payload of an ICMPv6 error message
fn parse_error_v6(
    icmp_data: &[u8],
    responder: IpAddr,
    filter: &ReplyFilter,
    kind: ReplyKind,
) -> Option<ParsedReply> {
    // Same layout as ICMPv4 except the RFC 4884 length sits in byte 4 and
    // counts 64-bit words
    if icmp_data.len() < 8 + IPV6_HEADER_LEN + 8 {
        debug!(%responder, len = icmp_data.len(), "ICMPv6 error too short");
        return None;
    }

    let original = &icmp_data[8..];
    if original[0] >> 4 != 6 {
        return None;
    }

    let mut dest = [0u8; 16];
    dest.copy_from_slice(&original[24..40]);
    let original_dest = IpAddr::V6(Ipv6Addr::from(dest));
    if !filter.is_probed_destination(original_dest) {
        debug!(%responder, %original_dest, "quoted destination is not ours");
        return None;
    }

    let (protocol, offset) = skip_ipv6_extension_headers(original)?;
    if original.len() < offset + 8 {
        return None;
    }

    let (key, sequence) =
        parse_quoted_transport(protocol, &original[offset..], ICMPV6_ECHO_REQUEST, filter)?;

    let extensions = parse_icmp_extensions(original, icmp_data[4] as usize * 8);

    Some(ParsedReply {
        key,
        sequence,
        kind,
        responder,
        original_dest,
        tcp_ack: None,
        extensions,
    })
}

/// Walk the extension headers of a quoted IPv6 datagram.
/// Returns the upper-layer protocol and its offset from the IPv6 header.
fn skip_ipv6_extension_headers(data: &[u8]) -> Option<(u8, usize)> {
    let mut next_header = data[6];
    let mut offset = IPV6_HEADER_LEN;

    loop {
        match next_header {
            IPV6_NH_HOP_BY_HOP | IPV6_NH_ROUTING | IPV6_NH_DEST_OPTS => {
                // Byte 0: Next Header, Byte 1: Length (in 8-octet units, excluding first 8)
                if data.len() < offset + 2 {
                    return None;
                }
                next_header = data[offset];
                offset += (data[offset + 1] as usize + 1) * 8;
                if offset > data.len() {
                    return None;
                }
            }
            // Non-first fragments carry no transport header
            IPV6_NH_FRAGMENT => return None,
            protocol => return Some((protocol, offset)),
        }
    }
}

/// Recover the correlation key from the quoted transport header
fn parse_quoted_transport(
    protocol: u8,
    transport: &[u8],
    echo_request_type: u8,
    filter: &ReplyFilter,
) -> Option<(CorrelationKey, u16)> {
    match protocol {
        IPPROTO_ICMP | IPPROTO_ICMPV6 => {
            // [0] type [1] code [2-3] checksum [4-5] identifier [6-7] sequence
            if transport[0] != echo_request_type {
                return None;
            }
            let identifier = u16::from_be_bytes([transport[4], transport[5]]);
            let sequence = u16::from_be_bytes([transport[6], transport[7]]);
            if identifier != filter.identifier {
                return None;
            }
            Some((
                CorrelationKey::Echo {
                    identifier,
                    sequence,
                },
                sequence,
            ))
        }
        IPPROTO_UDP => {
            // [0-1] src port [2-3] dst port [4-5] length [6-7] checksum
            let port = u16::from_be_bytes([transport[2], transport[3]]);
            let sequence = decode_port(filter.base_port, port)?;
            Some((
                CorrelationKey::Port {
                    protocol: ProbeProtocol::Udp,
                    port,
                },
                sequence,
            ))
        }
        IPPROTO_TCP => {
            let segment = parse_tcp_segment(transport)?;
            let sequence = decode_port(filter.base_port, segment.dst_port)?;
            // Our SYNs carry the probe sequence in the TCP sequence field
            if segment.sequence != sequence as u32 {
                debug!(
                    port = segment.dst_port,
                    quoted_seq = segment.sequence,
                    "quoted TCP sequence does not match port"
                );
                return None;
            }
            Some((
                CorrelationKey::Port {
                    protocol: ProbeProtocol::Tcp,
                    port: segment.dst_port,
                },
                sequence,
            ))
        }
        _ => None,
    }
}

/// Parse ICMP extensions from an error message payload (RFC 4884).
///
/// `original` starts at the quoted datagram. `original_len` is the RFC 4884
/// length converted to bytes; zero selects the legacy 128-byte offset.
fn parse_icmp_extensions(original: &[u8], original_len: usize) -> Option<IcmpExtensions> {
    let ext_start = if original_len > 0 {
        original_len
    } else {
        MIN_ORIGINAL_DATAGRAM
    };

    if original.len() < ext_start + 4 {
        return None;
    }

    let ext = &original[ext_start..];

    // Version (high nibble of first byte) must be 2
    if ext[0] >> 4 != ICMP_EXT_VERSION {
        return None;
    }

    let mut extensions = IcmpExtensions::default();
    let mut offset = 4;
    while offset + 4 <= ext.len() {
        // Object header: length (16 bits), class (8 bits), type (8 bits)
        let obj_length = u16::from_be_bytes([ext[offset], ext[offset + 1]]) as usize;
        let class = ext[offset + 2];
        let c_type = ext[offset + 3];

        if obj_length < 4 || offset + obj_length > ext.len() {
            break;
        }

        if class == MPLS_LABEL_STACK_CLASS && c_type == MPLS_LABEL_STACK_TYPE {
            for chunk in ext[offset + 4..offset + obj_length].chunks_exact(4) {
                let label = MplsLabel::from_bytes(&[chunk[0], chunk[1], chunk[2], chunk[3]]);
                extensions.mpls.push(label);
                if label.bottom {
                    break;
                }
            }
        } else {
            extensions.objects.push(ExtensionObject {
                class,
                c_type,
                length: obj_length as u16,
            });
        }

        offset += obj_length;
    }

    (!extensions.is_empty()).then_some(extensions)
}

/// Parse a segment from the raw TCP socket: a SYN-ACK or RST from the
/// destination answering one of our SYNs.
pub fn parse_tcp_reply(data: &[u8], responder: IpAddr, filter: &ReplyFilter) -> Option<ParsedReply> {
    if responder != filter.destination {
        return None;
    }

    let segment_data = if responder.is_ipv4() {
        let ip_packet = Ipv4Packet::new(data)?;
        if ip_packet.get_next_level_protocol() != IpNextHeaderProtocols::Tcp {
            return None;
        }
        let ihl = (ip_packet.get_header_length() as usize) * 4;
        data.get(ihl..)?
    } else {
        data
    };

    if segment_data.len() < TCP_HEADER_SIZE {
        return None;
    }
    let segment = parse_tcp_segment(segment_data)?;
    if segment.dst_port != filter.tcp_src_port {
        return None;
    }

    let kind = if segment.is_syn_ack() {
        ReplyKind::TcpSynAck
    } else if segment.is_reset() {
        ReplyKind::TcpReset
    } else {
        return None;
    };

    let sequence = decode_port(filter.base_port, segment.src_port)?;

    Some(ParsedReply {
        key: CorrelationKey::Port {
            protocol: ProbeProtocol::Tcp,
            port: segment.src_port,
        },
        sequence,
        kind,
        responder,
        original_dest: responder,
        tcp_ack: Some(segment.ack),
        extensions: None,
    })
}
