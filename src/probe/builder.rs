use std::net::IpAddr;

use crate::config::{Config, ProbeProtocol};
use crate::probe::correlate::ReplyFilter;
use crate::probe::icmp::{ICMP_HEADER_SIZE, build_echo_request};
use crate::probe::ip::DatagramSpec;
use crate::probe::tcp::{IPPROTO_TCP, build_tcp_syn};
use crate::probe::udp::{build_udp_payload, encode_port};
use crate::state::CorrelationKey;

/// A probe ready to hand to a [`Transport`](crate::probe::Transport)
#[derive(Debug, Clone)]
pub struct OutboundProbe {
    pub protocol: ProbeProtocol,
    pub ttl: u8,
    /// Per-protocol sequence, 1-based
    pub sequence: u16,
    pub key: CorrelationKey,
    /// Address passed to sendto
    pub target: IpAddr,
    /// UDP destination port, 0 for raw sends
    pub port: u16,
    /// ICMP message, UDP payload or complete IP datagram (TCP)
    pub bytes: Vec<u8>,
}

/// Builds the wire form of every probe in a session
#[derive(Debug, Clone)]
pub struct ProbeBuilder {
    identifier: u16,
    destination: IpAddr,
    route: Vec<IpAddr>,
    base_port: u16,
    tcp_src_port: u16,
    packet_size: usize,
    tcp_datagram: DatagramSpec,
}

impl ProbeBuilder {
    /// `identifier` tags ICMP echoes, `tcp_src_port` is the source port of
    /// every SYN. `source` is the local address the TCP checksum covers.
    pub fn new(
        config: &Config,
        destination: IpAddr,
        route: &[IpAddr],
        source: IpAddr,
        identifier: u16,
        tcp_src_port: u16,
    ) -> Self {
        Self {
            identifier,
            destination,
            route: route.to_vec(),
            base_port: config.port,
            tcp_src_port,
            packet_size: config.packet_size as usize,
            tcp_datagram: DatagramSpec {
                source,
                destination,
                protocol: IPPROTO_TCP,
                tos: config.tos,
                dont_fragment: config.dont_fragment,
                route: route.to_vec(),
            },
        }
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    pub fn tcp_src_port(&self) -> u16 {
        self.tcp_src_port
    }

    /// Filter that recognises replies to probes from this builder
    pub fn reply_filter(&self) -> ReplyFilter {
        ReplyFilter {
            identifier: self.identifier,
            destination: self.destination,
            route: self.route.clone(),
            base_port: self.base_port,
            tcp_src_port: self.tcp_src_port,
        }
    }

    /// Correlation key of the `sequence`-th probe of `protocol`
    pub fn key(&self, protocol: ProbeProtocol, sequence: u16) -> CorrelationKey {
        match protocol {
            ProbeProtocol::Icmp => CorrelationKey::Echo {
                identifier: self.identifier,
                sequence,
            },
            ProbeProtocol::Udp | ProbeProtocol::Tcp => CorrelationKey::Port {
                protocol,
                port: encode_port(self.base_port, sequence),
            },
        }
    }

    pub fn build(&self, protocol: ProbeProtocol, sequence: u16, ttl: u8) -> OutboundProbe {
        let key = self.key(protocol, sequence);
        let ipv6 = self.destination.is_ipv6();

        let (target, port, bytes) = match protocol {
            ProbeProtocol::Icmp => (
                self.destination,
                0,
                build_echo_request(
                    self.identifier,
                    sequence,
                    self.packet_size.saturating_sub(ICMP_HEADER_SIZE),
                    ipv6,
                ),
            ),
            ProbeProtocol::Udp => (
                self.destination,
                encode_port(self.base_port, sequence),
                build_udp_payload(self.packet_size),
            ),
            ProbeProtocol::Tcp => {
                let port = encode_port(self.base_port, sequence);
                let syn = build_tcp_syn(
                    self.tcp_src_port,
                    port,
                    sequence as u32,
                    self.tcp_datagram.source,
                    self.destination,
                );
                let datagram = self.tcp_datagram.encapsulate(ttl, rand::random(), &syn);
                (datagram.next_hop, 0, datagram.bytes)
            }
        };

        OutboundProbe {
            protocol,
            ttl,
            sequence,
            key,
            target,
            port,
            bytes,
        }
    }
}
