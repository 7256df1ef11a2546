//! IPv4/IPv6 headers for header-included probes, and the source-route
//! encodings shared with the socket-option path.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::probe::checksum::internet_checksum;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV6_HEADER_LEN: usize = 40;

/// IPv6 next-header value of a routing header
pub const IPPROTO_ROUTING: u8 = 43;

const IPOPT_NOP: u8 = 0x01;
const IPOPT_LSRR: u8 = 0x83;
/// Pointer to the first route slot (1-based, counted from the option type)
const IPOPT_MINOFF: u8 = 4;
const IP_FLAG_DF: u16 = 0x4000;
const ROUTING_TYPE_0: u8 = 0;

/// IPv4 loose source route option, preceded by one NOP so the whole option
/// occupies a multiple of 4 bytes.
///
/// `hops` lists every address after the one the packet is first sent to,
/// ending with the final destination.
pub fn lsrr_option(hops: &[Ipv4Addr]) -> Vec<u8> {
    let len = 3 + 4 * hops.len();
    let mut option = Vec::with_capacity(len + 1);
    option.push(IPOPT_NOP);
    option.push(IPOPT_LSRR);
    option.push(len as u8);
    option.push(IPOPT_MINOFF);
    for hop in hops {
        option.extend_from_slice(&hop.octets());
    }
    option
}

/// IPv6 type-0 routing header carrying `addresses`, all of them still to be
/// visited (segments left = address count).
pub fn routing_header_type0(next_header: u8, addresses: &[Ipv6Addr]) -> Vec<u8> {
    let segments = addresses.len();
    let mut header = Vec::with_capacity(8 + 16 * segments);
    // Header extension length counts 8-octet units after the first 8
    header.push(next_header);
    header.push((2 * segments) as u8);
    header.push(ROUTING_TYPE_0);
    header.push(segments as u8);
    header.extend_from_slice(&[0u8; 4]);
    for addr in addresses {
        header.extend_from_slice(&addr.octets());
    }
    // 8 + 16n is always 8-aligned, pad anyway in case the layout changes
    while header.len() % 8 != 0 {
        header.push(0);
    }
    header
}

/// Fixed per-session parameters of header-included datagrams
#[derive(Debug, Clone)]
pub struct DatagramSpec {
    pub source: IpAddr,
    /// Final destination
    pub destination: IpAddr,
    /// Upper-layer protocol number
    pub protocol: u8,
    /// ToS byte (IPv4) or traffic class (IPv6)
    pub tos: u8,
    pub dont_fragment: bool,
    /// Intermediate gateways, same family as `destination`
    pub route: Vec<IpAddr>,
}

/// A complete datagram ready for a raw header-included socket
#[derive(Debug, Clone)]
pub struct Datagram {
    pub bytes: Vec<u8>,
    /// Address the datagram is handed to: the first gateway when source
    /// routed, the destination otherwise
    pub next_hop: IpAddr,
}

impl DatagramSpec {
    /// Wrap `segment` in an IP header carrying `ttl`
    pub fn encapsulate(&self, ttl: u8, identification: u16, segment: &[u8]) -> Datagram {
        match self.destination {
            IpAddr::V4(destination) => self.encapsulate_v4(destination, ttl, identification, segment),
            IpAddr::V6(destination) => self.encapsulate_v6(destination, ttl, segment),
        }
    }

    fn encapsulate_v4(
        &self,
        destination: Ipv4Addr,
        ttl: u8,
        identification: u16,
        segment: &[u8],
    ) -> Datagram {
        let source = match self.source {
            IpAddr::V4(source) => source,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let route: Vec<Ipv4Addr> = self
            .route
            .iter()
            .filter_map(|addr| match addr {
                IpAddr::V4(v4) => Some(*v4),
                IpAddr::V6(_) => None,
            })
            .collect();

        let (first_hop, options) = match route.split_first() {
            Some((first, rest)) => {
                let mut hops = rest.to_vec();
                hops.push(destination);
                (*first, lsrr_option(&hops))
            }
            None => (destination, Vec::new()),
        };

        let header_len = IPV4_HEADER_LEN + options.len();
        let total_len = header_len + segment.len();
        let mut bytes = Vec::with_capacity(total_len);

        bytes.push(0x40 | (header_len / 4) as u8);
        bytes.push(self.tos);
        bytes.extend_from_slice(&(total_len as u16).to_be_bytes());
        bytes.extend_from_slice(&identification.to_be_bytes());
        let flags = if self.dont_fragment { IP_FLAG_DF } else { 0 };
        bytes.extend_from_slice(&flags.to_be_bytes());
        bytes.push(ttl);
        bytes.push(self.protocol);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&source.octets());
        bytes.extend_from_slice(&first_hop.octets());
        bytes.extend_from_slice(&options);

        let checksum = internet_checksum(&bytes[..header_len]);
        bytes[10..12].copy_from_slice(&checksum.to_be_bytes());
        bytes.extend_from_slice(segment);

        Datagram {
            bytes,
            next_hop: IpAddr::V4(first_hop),
        }
    }

    fn encapsulate_v6(&self, destination: Ipv6Addr, hop_limit: u8, segment: &[u8]) -> Datagram {
        let source = match self.source {
            IpAddr::V6(source) => source,
            IpAddr::V4(_) => Ipv6Addr::UNSPECIFIED,
        };
        let route: Vec<Ipv6Addr> = self
            .route
            .iter()
            .filter_map(|addr| match addr {
                IpAddr::V6(v6) => Some(*v6),
                IpAddr::V4(_) => None,
            })
            .collect();

        let (first_hop, next_header, extension) = match route.split_first() {
            Some((first, rest)) => {
                let mut hops = rest.to_vec();
                hops.push(destination);
                (
                    *first,
                    IPPROTO_ROUTING,
                    routing_header_type0(self.protocol, &hops),
                )
            }
            None => (destination, self.protocol, Vec::new()),
        };

        let payload_len = extension.len() + segment.len();
        let mut bytes = Vec::with_capacity(IPV6_HEADER_LEN + payload_len);

        // version(4) traffic class(8) flow label(20)
        let first_word: u32 = (6 << 28) | ((self.tos as u32) << 20);
        bytes.extend_from_slice(&first_word.to_be_bytes());
        bytes.extend_from_slice(&(payload_len as u16).to_be_bytes());
        bytes.push(next_header);
        bytes.push(hop_limit);
        bytes.extend_from_slice(&source.octets());
        bytes.extend_from_slice(&first_hop.octets());
        bytes.extend_from_slice(&extension);
        bytes.extend_from_slice(segment);

        Datagram {
            bytes,
            next_hop: IpAddr::V6(first_hop),
        }
    }
}
