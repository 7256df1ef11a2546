use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::{Config, ProbeProtocol};
use crate::error::TraceError;
use crate::probe::builder::OutboundProbe;
use crate::probe::ip::lsrr_option;
use crate::probe::tcp::{create_tcp_recv_socket, create_tcp_send_socket};
use crate::probe::udp::create_udp_socket;

/// Largest packet read from a raw socket
const RECV_BUFFER_SIZE: usize = 1500;

// Linux socket options libc does not export for every target
const IP_MTU_DISCOVER: libc::c_int = 10;
const IP_PMTUDISC_DO: libc::c_int = 2;
const IPV6_DONTFRAG: libc::c_int = 62;
const IPV6_RTHDR: libc::c_int = 57;

/// Socket a packet arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyChannel {
    /// Raw ICMP/ICMPv6 socket
    Icmp,
    /// Raw TCP socket
    Tcp,
}

/// A packet read from the network
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub channel: ReplyChannel,
    pub responder: IpAddr,
    pub data: Vec<u8>,
    pub received_at: Instant,
}

/// Sends probes and receives candidate replies.
///
/// Sending happens from the engine task; receiving from the receiver thread.
pub trait Transport: Send + Sync {
    fn send(&self, probe: &OutboundProbe) -> io::Result<usize>;

    /// Wait up to `timeout` for packets. An empty batch means timeout.
    fn recv(&self, timeout: Duration) -> io::Result<Vec<InboundPacket>>;
}

/// Transport for simulate mode: sends nothing, never receives
#[derive(Debug, Default)]
pub struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, probe: &OutboundProbe) -> io::Result<usize> {
        Ok(probe.bytes.len())
    }

    fn recv(&self, timeout: Duration) -> io::Result<Vec<InboundPacket>> {
        std::thread::sleep(timeout);
        Ok(Vec::new())
    }
}

/// Create a raw ICMP socket
pub fn create_raw_icmp_socket(ipv6: bool) -> io::Result<Socket> {
    let domain = if ipv6 { Domain::IPV6 } else { Domain::IPV4 };
    let protocol = if ipv6 {
        Protocol::ICMPV6
    } else {
        Protocol::ICMPV4
    };

    let socket = Socket::new(domain, Type::RAW, Some(protocol))?;
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    Ok(socket)
}

fn setsockopt_raw(
    socket: &Socket,
    level: libc::c_int,
    name: libc::c_int,
    value: &[u8],
) -> io::Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            value.as_ptr() as *const libc::c_void,
            value.len() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set Don't Fragment flag for Path MTU Discovery
/// - IPv4: Sets IP_MTU_DISCOVER = IP_PMTUDISC_DO (always set DF bit)
/// - IPv6: Sets IPV6_DONTFRAG = 1 (prevent source fragmentation)
pub fn set_dont_fragment(socket: &Socket, ipv6: bool) -> io::Result<()> {
    if ipv6 {
        let val: libc::c_int = 1;
        setsockopt_raw(socket, libc::IPPROTO_IPV6, IPV6_DONTFRAG, &val.to_ne_bytes())
    } else {
        let val: libc::c_int = IP_PMTUDISC_DO;
        setsockopt_raw(socket, libc::IPPROTO_IP, IP_MTU_DISCOVER, &val.to_ne_bytes())
    }
}

/// Set the ToS byte (IPv4) or traffic class (IPv6)
pub fn set_tos(socket: &Socket, tos: u8, ipv6: bool) -> io::Result<()> {
    if ipv6 {
        socket.set_tclass_v6(tos as u32)
    } else {
        socket.set_tos(tos as u32)
    }
}

/// Set TTL or hop limit
pub fn set_ttl(socket: &Socket, ttl: u8, ipv6: bool) -> io::Result<()> {
    if ipv6 {
        socket.set_unicast_hops_v6(ttl as u32)
    } else {
        socket.set_ttl(ttl as u32)
    }
}

/// Install an IPv4 loose source route through `gateways` to `destination`
pub fn set_source_route_v4(
    socket: &Socket,
    gateways: &[Ipv4Addr],
    destination: Ipv4Addr,
) -> io::Result<()> {
    // The kernel takes the first slot as next hop and rewrites the last
    // with the sendto destination
    let mut hops = gateways.to_vec();
    hops.push(destination);
    setsockopt_raw(socket, libc::IPPROTO_IP, libc::IP_OPTIONS, &lsrr_option(&hops))
}

/// Install an IPv6 type-0 routing header through `gateways`
pub fn set_source_route_v6(socket: &Socket, gateways: &[Ipv6Addr]) -> io::Result<()> {
    // Next header is filled in by the kernel
    let header = crate::probe::ip::routing_header_type0(0, gateways);
    setsockopt_raw(socket, libc::IPPROTO_IPV6, IPV6_RTHDR, &header)
}

/// Bind socket to a specific source IP address
pub fn bind_to_source_ip(socket: &Socket, ip: IpAddr) -> io::Result<()> {
    let addr = SocketAddr::new(ip, 0);
    socket.bind(&SockAddr::from(addr))
}

/// Parse sockaddr_storage to IpAddr
fn parse_sockaddr_storage(storage: &libc::sockaddr_storage) -> Option<IpAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let addr: &libc::sockaddr_in = unsafe { &*(storage as *const _ as *const _) };
            Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr))))
        }
        libc::AF_INET6 => {
            let addr: &libc::sockaddr_in6 = unsafe { &*(storage as *const _ as *const _) };
            Some(IpAddr::V6(Ipv6Addr::from(addr.sin6_addr.s6_addr)))
        }
        _ => None,
    }
}

/// Read one datagram without blocking. Ok(None) when the queue is empty;
/// the address is None for families other than IPv4/IPv6.
fn recv_packet(socket: &Socket, buffer: &mut [u8]) -> io::Result<Option<(usize, Option<IpAddr>)>> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut addr_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    let len = unsafe {
        libc::recvfrom(
            socket.as_raw_fd(),
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
            libc::MSG_DONTWAIT,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        )
    };

    if len < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err),
        };
    }

    Ok(Some((len as usize, parse_sockaddr_storage(&storage))))
}

/// Raw-socket transport
pub struct RawTransport {
    ipv6: bool,
    /// Sends echo requests, receives every ICMP reply
    icmp: Socket,
    udp: Option<Socket>,
    tcp_send: Option<Socket>,
    tcp_recv: Option<Socket>,
}

impl RawTransport {
    /// Open the sockets needed to probe `destination` with the configured
    /// protocols through `route`
    pub fn open(config: &Config, destination: IpAddr, route: &[IpAddr]) -> Result<Self, TraceError> {
        let ipv6 = destination.is_ipv6();
        let uses = |protocol| config.protocols.contains(&protocol);

        let icmp =
            create_raw_icmp_socket(ipv6).map_err(|e| TraceError::socket(ProbeProtocol::Icmp, e))?;
        if uses(ProbeProtocol::Icmp)
            && let Some(ip) = config.source_ip
        {
            bind_to_source_ip(&icmp, ip).map_err(TraceError::SocketOption)?;
        }

        let udp = if uses(ProbeProtocol::Udp) {
            Some(
                create_udp_socket(ipv6, config.src_port, config.source_ip)
                    .map_err(|e| TraceError::socket(ProbeProtocol::Udp, e))?,
            )
        } else {
            None
        };

        let (tcp_send, tcp_recv) = if uses(ProbeProtocol::Tcp) {
            let send =
                create_tcp_send_socket(ipv6).map_err(|e| TraceError::socket(ProbeProtocol::Tcp, e))?;
            let recv =
                create_tcp_recv_socket(ipv6).map_err(|e| TraceError::socket(ProbeProtocol::Tcp, e))?;
            (Some(send), Some(recv))
        } else {
            (None, None)
        };

        // Kernel-built headers: ToS, DF and source route are socket options.
        // TCP datagrams carry them in the header we build.
        for socket in std::iter::once(&icmp).chain(udp.as_ref()) {
            if config.tos != 0 {
                set_tos(socket, config.tos, ipv6).map_err(TraceError::SocketOption)?;
            }
            if config.dont_fragment {
                set_dont_fragment(socket, ipv6).map_err(TraceError::SocketOption)?;
            }
            if !route.is_empty() {
                install_route(socket, destination, route)?;
            }
        }

        debug!(
            ipv6,
            udp = udp.is_some(),
            tcp = tcp_send.is_some(),
            "raw transport ready"
        );

        Ok(Self {
            ipv6,
            icmp,
            udp,
            tcp_send,
            tcp_recv,
        })
    }

    fn socket_for(&self, protocol: ProbeProtocol) -> io::Result<&Socket> {
        let socket = match protocol {
            ProbeProtocol::Icmp => Some(&self.icmp),
            ProbeProtocol::Udp => self.udp.as_ref(),
            ProbeProtocol::Tcp => self.tcp_send.as_ref(),
        };
        socket.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no socket open for {protocol}"),
            )
        })
    }
}

fn install_route(socket: &Socket, destination: IpAddr, route: &[IpAddr]) -> Result<(), TraceError> {
    match destination {
        IpAddr::V4(dest) => {
            let gateways: Vec<Ipv4Addr> = route
                .iter()
                .filter_map(|addr| match addr {
                    IpAddr::V4(v4) => Some(*v4),
                    IpAddr::V6(_) => None,
                })
                .collect();
            set_source_route_v4(socket, &gateways, dest).map_err(TraceError::SocketOption)
        }
        IpAddr::V6(_) => {
            let gateways: Vec<Ipv6Addr> = route
                .iter()
                .filter_map(|addr| match addr {
                    IpAddr::V6(v6) => Some(*v6),
                    IpAddr::V4(_) => None,
                })
                .collect();
            // Most kernels refuse type-0 routing headers
            if let Err(e) = set_source_route_v6(socket, &gateways) {
                warn!(error = %e, "IPv6 routing header rejected, probing without source route");
            }
            Ok(())
        }
    }
}

impl Transport for RawTransport {
    fn send(&self, probe: &OutboundProbe) -> io::Result<usize> {
        let socket = self.socket_for(probe.protocol)?;

        // Header-included TCP datagrams carry their own TTL
        if probe.protocol != ProbeProtocol::Tcp {
            set_ttl(socket, probe.ttl, self.ipv6)?;
        }

        let addr = SockAddr::from(SocketAddr::new(probe.target, probe.port));
        socket.send_to(&probe.bytes, &addr)
    }

    fn recv(&self, timeout: Duration) -> io::Result<Vec<InboundPacket>> {
        let mut sockets = vec![(ReplyChannel::Icmp, &self.icmp)];
        if let Some(tcp) = &self.tcp_recv {
            sockets.push((ReplyChannel::Tcp, tcp));
        }

        let mut fds: Vec<libc::pollfd> = sockets
            .iter()
            .map(|(_, socket)| libc::pollfd {
                fd: socket.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut packets = Vec::new();
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        for (pollfd, (channel, socket)) in fds.iter().zip(&sockets) {
            if pollfd.revents & libc::POLLNVAL != 0 {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            if pollfd.revents & (libc::POLLIN | libc::POLLERR) == 0 {
                continue;
            }
            // One packet per ready socket
            let Some((len, responder)) = recv_packet(socket, &mut buffer)? else {
                continue;
            };
            let Some(responder) = responder else {
                debug!(len, "dropping packet from unknown address family");
                continue;
            };
            packets.push(InboundPacket {
                channel: *channel,
                responder,
                data: buffer[..len].to_vec(),
                received_at: Instant::now(),
            });
        }

        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::builder::ProbeBuilder;

    #[test]
    fn test_null_transport_accepts_everything() {
        let config = Config::for_destination("192.0.2.1");
        let dest = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1));
        let builder = ProbeBuilder::new(&config, dest, &[], dest, 1, 40000);
        let probe = builder.build(ProbeProtocol::Udp, 1, 1);

        let transport = NullTransport;
        assert_eq!(transport.send(&probe).unwrap(), probe.bytes.len());
        assert!(transport.recv(Duration::from_millis(1)).unwrap().is_empty());
    }

    #[test]
    fn test_parse_sockaddr_storage_v4() {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let addr = SockAddr::from(SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)), 0));
        unsafe {
            std::ptr::copy_nonoverlapping(
                addr.as_ptr() as *const u8,
                &mut storage as *mut _ as *mut u8,
                addr.len() as usize,
            );
        }
        assert_eq!(
            parse_sockaddr_storage(&storage),
            Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9)))
        );

        let unknown: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        assert_eq!(parse_sockaddr_storage(&unknown), None);
    }
}
