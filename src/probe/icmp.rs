use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet::packet::icmp::{IcmpCode, IcmpType, IcmpTypes};
use pnet::packet::{MutablePacket, Packet};

use crate::probe::checksum::internet_checksum;

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;

/// Fill a probe payload with a repeating byte pattern
pub fn fill_pattern(payload: &mut [u8]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = (i & 0xFF) as u8;
    }
}

/// Build an ICMP Echo Request with `payload_size` filler bytes.
///
/// Set ipv6=true to build an ICMPv6 Echo Request. Its checksum stays zero:
/// the kernel fills it in because it owns the IPv6 pseudo-header.
pub fn build_echo_request(
    identifier: u16,
    sequence: u16,
    payload_size: usize,
    ipv6: bool,
) -> Vec<u8> {
    let mut buffer = vec![0u8; ICMP_HEADER_SIZE + payload_size];

    // The buffer always holds at least the 8-byte echo header
    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buffer) {
        let icmp_type = if ipv6 {
            IcmpType::new(ICMPV6_ECHO_REQUEST)
        } else {
            IcmpTypes::EchoRequest
        };
        packet.set_icmp_type(icmp_type);
        packet.set_icmp_code(IcmpCode::new(0));
        packet.set_identifier(identifier);
        packet.set_sequence_number(sequence);
        fill_pattern(packet.payload_mut());

        if !ipv6 {
            let cksum = internet_checksum(packet.packet());
            packet.set_checksum(cksum);
        }
    }

    buffer
}
