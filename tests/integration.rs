//! Integration tests for the probe→receive→aggregate pipeline
//!
//! A scripted transport plays the network: every probe handed to it may be
//! answered with a wire-format reply built the way a router or the
//! destination would build it. No raw sockets or privileges are needed.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use tracehop::probe::checksum::internet_checksum;
use tracehop::probe::{InboundPacket, OutboundProbe, ReplyChannel, Transport};
use tracehop::state::{CorrelationKey, OutcomeKind, ProbeOutcome, ProtocolHop, ReplyKind};
use tracehop::{Config, ConfigError, ProbeProtocol, ResolvedTarget, TraceError, Tracer, run_trace};

const DEST: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 7);

fn router(ttl: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, ttl))
}

/// How the simulated network treats a probe
#[derive(Clone, Copy)]
enum Answer {
    /// Time exceeded from the router at this TTL
    Router,
    /// Destination replies (echo reply, port unreachable or SYN-ACK)
    Destination,
    Silent,
}

type Script = dyn Fn(&OutboundProbe) -> Answer + Send + Sync;

struct ScriptedNetwork {
    script: Box<Script>,
    inbox: Mutex<VecDeque<InboundPacket>>,
    ready: Condvar,
    sent: Mutex<Vec<(ProbeProtocol, u8, u16)>>,
    sent_at: Mutex<Vec<Instant>>,
    /// Replies to the n-th probe of a protocol arrive n * reply_delay late
    reply_delay: Duration,
    fail_sequence: Option<(ProbeProtocol, u16)>,
    recv_error: Option<i32>,
}

impl ScriptedNetwork {
    fn new(script: impl Fn(&OutboundProbe) -> Answer + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            inbox: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            sent: Mutex::new(Vec::new()),
            sent_at: Mutex::new(Vec::new()),
            reply_delay: Duration::ZERO,
            fail_sequence: None,
            recv_error: None,
        }
    }

    /// Routers up to `dest_ttl - 1`, the destination from `dest_ttl` on
    fn path(dest_ttl: u8) -> Self {
        Self::new(move |probe| {
            if probe.ttl >= dest_ttl {
                Answer::Destination
            } else {
                Answer::Router
            }
        })
    }

    fn sent_ttls(&self) -> Vec<u8> {
        self.sent.lock().iter().map(|&(_, ttl, _)| ttl).collect()
    }

    /// Queue a reply; it becomes readable at `received_at`
    fn deliver(
        &self,
        probe: &OutboundProbe,
        responder: IpAddr,
        channel: ReplyChannel,
        data: Vec<u8>,
    ) {
        self.inbox.lock().push_back(InboundPacket {
            channel,
            responder,
            data,
            received_at: Instant::now() + self.reply_delay * probe.sequence as u32,
        });
        self.ready.notify_one();
    }
}

impl Transport for ScriptedNetwork {
    fn send(&self, probe: &OutboundProbe) -> io::Result<usize> {
        if self.fail_sequence == Some((probe.protocol, probe.sequence)) {
            return Err(io::Error::from(io::ErrorKind::NetworkUnreachable));
        }
        self.sent
            .lock()
            .push((probe.protocol, probe.ttl, probe.sequence));
        self.sent_at.lock().push(Instant::now());

        let dest = IpAddr::V4(DEST);
        match (self.script)(probe) {
            Answer::Silent => {}
            Answer::Router => {
                let quoted = quoted_datagram(probe);
                self.deliver(
                    probe,
                    router(probe.ttl),
                    ReplyChannel::Icmp,
                    icmp_error(router(probe.ttl), 11, 0, &quoted),
                );
            }
            Answer::Destination => match probe.protocol {
                ProbeProtocol::Icmp => {
                    self.deliver(probe, dest, ReplyChannel::Icmp, echo_reply(&probe.bytes));
                }
                ProbeProtocol::Udp => {
                    let quoted = quoted_datagram(probe);
                    self.deliver(probe, dest, ReplyChannel::Icmp, icmp_error(dest, 3, 3, &quoted));
                }
                ProbeProtocol::Tcp => {
                    self.deliver(probe, dest, ReplyChannel::Tcp, syn_ack(probe));
                }
            },
        }
        Ok(probe.bytes.len())
    }

    fn recv(&self, timeout: Duration) -> io::Result<Vec<InboundPacket>> {
        if let Some(errno) = self.recv_error {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let deadline = Instant::now() + timeout;
        let mut inbox = self.inbox.lock();
        loop {
            let now = Instant::now();
            if now >= deadline || inbox.iter().any(|p| p.received_at <= now) {
                break;
            }
            let wake = inbox
                .iter()
                .map(|p| p.received_at)
                .min()
                .map_or(deadline, |due| due.min(deadline));
            self.ready.wait_until(&mut inbox, wake);
        }

        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) =
            inbox.drain(..).partition(|p| p.received_at <= now);
        *inbox = VecDeque::from(later);
        Ok(due)
    }
}

fn ipv4_header(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
    let mut header = vec![0u8; 20];
    header[0] = 0x45;
    header[2..4].copy_from_slice(&((20 + payload_len) as u16).to_be_bytes());
    header[8] = 64;
    header[9] = protocol;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());
    header
}

fn as_v4(addr: IpAddr) -> Ipv4Addr {
    match addr {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => unreachable!("IPv4 only"),
    }
}

/// The original datagram as a router quotes it: IP header plus the first
/// eight bytes of the transport header
fn quoted_datagram(probe: &OutboundProbe) -> Vec<u8> {
    match probe.protocol {
        ProbeProtocol::Icmp => {
            let mut quoted = ipv4_header(1, Ipv4Addr::new(192, 0, 2, 10), DEST, 8);
            quoted.extend_from_slice(&probe.bytes[..8]);
            quoted
        }
        ProbeProtocol::Udp => {
            let mut quoted = ipv4_header(17, Ipv4Addr::new(192, 0, 2, 10), DEST, 8);
            quoted.extend_from_slice(&40000u16.to_be_bytes());
            quoted.extend_from_slice(&probe.port.to_be_bytes());
            quoted.extend_from_slice(&[0, 8, 0, 0]);
            quoted
        }
        // SYN probes are complete IP datagrams already
        ProbeProtocol::Tcp => probe.bytes[..28].to_vec(),
    }
}

fn icmp_error(responder: IpAddr, icmp_type: u8, code: u8, quoted: &[u8]) -> Vec<u8> {
    let mut icmp = vec![icmp_type, code, 0, 0, 0, 0, 0, 0];
    icmp.extend_from_slice(quoted);
    let checksum = internet_checksum(&icmp);
    icmp[2..4].copy_from_slice(&checksum.to_be_bytes());

    let mut packet = ipv4_header(1, as_v4(responder), Ipv4Addr::new(192, 0, 2, 10), icmp.len());
    packet.extend_from_slice(&icmp);
    packet
}

fn echo_reply(request: &[u8]) -> Vec<u8> {
    let mut icmp = request.to_vec();
    icmp[0] = 0;
    icmp[2..4].copy_from_slice(&[0, 0]);
    let checksum = internet_checksum(&icmp);
    icmp[2..4].copy_from_slice(&checksum.to_be_bytes());

    let mut packet = ipv4_header(1, DEST, Ipv4Addr::new(192, 0, 2, 10), icmp.len());
    packet.extend_from_slice(&icmp);
    packet
}

fn syn_ack(probe: &OutboundProbe) -> Vec<u8> {
    let CorrelationKey::Port { port, .. } = probe.key else {
        unreachable!("TCP probes carry a port key");
    };
    // Source port of the SYN sits right after our 20-byte IP header
    let syn_src_port = &probe.bytes[20..22];

    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&port.to_be_bytes());
    tcp[2..4].copy_from_slice(syn_src_port);
    tcp[4..8].copy_from_slice(&0x1000_0000u32.to_be_bytes());
    tcp[8..12].copy_from_slice(&(probe.sequence as u32 + 1).to_be_bytes());
    tcp[12] = 0x50;
    tcp[13] = 0x12;

    let mut packet = ipv4_header(6, DEST, Ipv4Addr::new(192, 0, 2, 10), tcp.len());
    packet.extend_from_slice(&tcp);
    packet
}

fn replies(hop: &ProtocolHop) -> impl Iterator<Item = &ProbeOutcome> {
    hop.outcomes.iter().filter(|o| o.kind == OutcomeKind::Reply)
}

fn config(protocols: Vec<ProbeProtocol>) -> Config {
    Config {
        protocols,
        max_hops: 10,
        queries: 3,
        timeout: Duration::from_millis(300),
        series_interval: Duration::ZERO,
        ..Config::for_destination(DEST.to_string())
    }
}

async fn trace(
    config: Config,
    network: Arc<ScriptedNetwork>,
    cancel: CancellationToken,
) -> Result<tracehop::SessionResult, TraceError> {
    let target = ResolvedTarget::from_addr(IpAddr::V4(DEST));
    Tracer::with_transport(config, target, network, cancel)?
        .run()
        .await
}

#[tokio::test]
async fn test_echo_reply_at_ttl_five_stops_trace() {
    let network = Arc::new(ScriptedNetwork::path(5));
    let result = trace(
        config(vec![ProbeProtocol::Icmp]),
        Arc::clone(&network),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(result.reached);
    assert!(!result.cancelled);
    assert_eq!(result.destination_ttl(), Some(5));
    assert_eq!(result.hops.len(), 5);
    assert!(network.sent_ttls().iter().all(|&ttl| ttl <= 5));

    for ttl in 1..=4u8 {
        let hop = result.hop(ttl).unwrap();
        assert_eq!(hop.responders(), vec![router(ttl)]);
        let icmp = hop.protocol(ProbeProtocol::Icmp).unwrap();
        assert_eq!(icmp.stats().sent, 3);
        assert_eq!(icmp.stats().loss, 0.0);
        assert!(
            icmp.outcomes
                .iter()
                .all(|o| o.reply == Some(ReplyKind::TimeExceeded(0)))
        );
    }

    let last = result.hop(5).unwrap().protocol(ProbeProtocol::Icmp).unwrap();
    assert_eq!(last.outcomes.len(), 3);
    assert_eq!(last.responses(), 3);
    assert!(
        replies(last)
            .all(|o| o.reached && o.reply == Some(ReplyKind::EchoReply))
    );
}

#[tokio::test]
async fn test_udp_port_unreachable_marks_destination() {
    let network = Arc::new(ScriptedNetwork::path(3));
    let result = trace(
        config(vec![ProbeProtocol::Udp]),
        Arc::clone(&network),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.destination_ttl(), Some(3));
    let last = result.hop(3).unwrap().protocol(ProbeProtocol::Udp).unwrap();
    assert_eq!(last.responses(), 3);
    assert!(replies(last).all(|o| o.reply == Some(ReplyKind::DestUnreachable(3))));
    // Sequences keep counting across TTLs
    let sequences: Vec<u16> = network.sent.lock().iter().map(|&(_, _, s)| s).collect();
    assert_eq!(sequences, (1..=9).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_tcp_syn_ack_reaches_destination() {
    let network = Arc::new(ScriptedNetwork::path(2));
    let result = trace(
        Config {
            src_port: Some(45000),
            ..config(vec![ProbeProtocol::Tcp])
        },
        Arc::clone(&network),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.destination_ttl(), Some(2));
    let first = result.hop(1).unwrap().protocol(ProbeProtocol::Tcp).unwrap();
    assert_eq!(first.responses(), 3);
    let last = result.hop(2).unwrap().protocol(ProbeProtocol::Tcp).unwrap();
    assert_eq!(last.responses(), 3);
    assert!(replies(last).all(|o| o.reply == Some(ReplyKind::TcpSynAck) && o.reached));
}

#[tokio::test]
async fn test_late_destination_replies_are_not_counted_lost() {
    let mut network = ScriptedNetwork::path(1);
    network.reply_delay = Duration::from_millis(40);
    let started = Instant::now();
    let result = trace(
        Config {
            timeout: Duration::from_secs(2),
            ..config(vec![ProbeProtocol::Icmp])
        },
        Arc::new(network),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.destination_ttl(), Some(1));
    let hop = result.hop(1).unwrap().protocol(ProbeProtocol::Icmp).unwrap();
    assert_eq!(hop.responses(), 3);
    assert_eq!(hop.stats().loss, 0.0);
    assert!(hop.outcomes.iter().all(|o| o.kind == OutcomeKind::Reply && o.reached));
    assert!(hop.stats().max_ms.unwrap() >= 100.0);
    // The hop settles on the last reply, well before the timeout
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_failed_send_skips_send_interval() {
    let mut network = ScriptedNetwork::path(1);
    network.fail_sequence = Some((ProbeProtocol::Icmp, 2));
    let network = Arc::new(network);
    trace(
        Config {
            interval: Duration::from_millis(150),
            ..config(vec![ProbeProtocol::Icmp])
        },
        Arc::clone(&network),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    // Probes 1 and 3 went out; only one interval separates them
    let sent_at = network.sent_at.lock().clone();
    assert_eq!(sent_at.len(), 2);
    let gap = sent_at[1] - sent_at[0];
    assert!(gap >= Duration::from_millis(150));
    assert!(gap < Duration::from_millis(300), "gap was {gap:?}");
}

#[tokio::test]
async fn test_every_protocol_probed_per_ttl() {
    let network = Arc::new(ScriptedNetwork::path(2));
    let result = trace(
        Config {
            queries: 2,
            series_count: 2,
            ..config(vec![ProbeProtocol::Udp, ProbeProtocol::Icmp])
        },
        Arc::clone(&network),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    for hop in &result.hops {
        let order: Vec<ProbeProtocol> = hop.protocols.iter().map(|p| p.protocol).collect();
        assert_eq!(order, vec![ProbeProtocol::Udp, ProbeProtocol::Icmp]);
        for protocol in &hop.protocols {
            assert_eq!(protocol.sent, 4);
            assert_eq!(protocol.outcomes.len(), 4);
        }
    }
    assert_eq!(result.total_sent(), 16);

    // Series -> protocol -> query
    let sent = network.sent.lock().clone();
    let first_ttl: Vec<ProbeProtocol> = sent
        .iter()
        .filter(|&&(_, ttl, _)| ttl == 1)
        .map(|&(p, _, _)| p)
        .collect();
    assert_eq!(
        first_ttl,
        vec![
            ProbeProtocol::Udp,
            ProbeProtocol::Udp,
            ProbeProtocol::Icmp,
            ProbeProtocol::Icmp,
            ProbeProtocol::Udp,
            ProbeProtocol::Udp,
            ProbeProtocol::Icmp,
            ProbeProtocol::Icmp,
        ]
    );
}

#[tokio::test]
async fn test_silent_hop_times_out_and_trace_continues() {
    let network = Arc::new(ScriptedNetwork::new(|probe| match probe.ttl {
        2 => Answer::Silent,
        ttl if ttl >= 3 => Answer::Destination,
        _ => Answer::Router,
    }));
    let started = Instant::now();
    let result = trace(
        config(vec![ProbeProtocol::Icmp]),
        Arc::clone(&network),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(result.destination_ttl(), Some(3));

    let silent = result.hop(2).unwrap().protocol(ProbeProtocol::Icmp).unwrap();
    assert_eq!(silent.outcomes.len(), 3);
    assert!(silent.outcomes.iter().all(|o| o.kind == OutcomeKind::Timeout));
    assert_eq!(silent.stats().loss, 1.0);
    assert!(result.hop(2).unwrap().responders().is_empty());
}

#[tokio::test]
async fn test_send_failure_discards_probe() {
    let mut network = ScriptedNetwork::path(1);
    network.fail_sequence = Some((ProbeProtocol::Icmp, 2));
    let result = trace(
        config(vec![ProbeProtocol::Icmp]),
        Arc::new(network),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let hop = result.hop(1).unwrap().protocol(ProbeProtocol::Icmp).unwrap();
    assert_eq!(hop.sent, 2);
    assert_eq!(hop.outcomes.len(), 2);
    assert_eq!(hop.stats().loss, 0.0);
    let sequences: Vec<u16> = hop.outcomes.iter().map(|o| o.sequence).collect();
    assert!(!sequences.contains(&2));
}

#[tokio::test]
async fn test_cancellation_stops_session() {
    let network = Arc::new(ScriptedNetwork::new(|_| Answer::Silent));
    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = trace(
        Config {
            timeout: Duration::from_secs(5),
            ..config(vec![ProbeProtocol::Icmp])
        },
        network,
        cancel,
    )
    .await
    .unwrap();

    assert!(result.cancelled);
    assert!(!result.reached);
    assert!(started.elapsed() < Duration::from_secs(2));
    // Outstanding probes of the interrupted hop become timeouts
    let hop = result.hop(1).unwrap().protocol(ProbeProtocol::Icmp).unwrap();
    assert_eq!(hop.outcomes.len() as u64, hop.sent);
    assert!(hop.outcomes.iter().all(|o| o.kind == OutcomeKind::Timeout));
}

#[tokio::test]
async fn test_fatal_receive_error_aborts_trace() {
    let mut network = ScriptedNetwork::new(|_| Answer::Silent);
    network.recv_error = Some(libc::EBADF);
    let err = trace(
        Config {
            timeout: Duration::from_secs(5),
            ..config(vec![ProbeProtocol::Icmp])
        },
        Arc::new(network),
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, TraceError::Receiver(_)));
}

#[tokio::test]
async fn test_simulated_trace_sends_nothing() {
    let result = run_trace(
        Config {
            simulate: true,
            max_hops: 3,
            queries: 2,
            ..config(vec![ProbeProtocol::Udp, ProbeProtocol::Tcp, ProbeProtocol::Icmp])
        },
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(result.simulated);
    assert!(!result.reached);
    assert_eq!(result.hops.len(), 3);
    assert_eq!(result.total_sent(), 18);
    for protocol in result.hops.iter().flat_map(|h| &h.protocols) {
        assert_eq!(protocol.simulated, 2);
        assert_eq!(protocol.stats().loss, 0.0);
        assert!(
            protocol
                .outcomes
                .iter()
                .all(|o| o.kind == OutcomeKind::Simulated && o.responder.is_none())
        );
    }
}

#[tokio::test]
async fn test_nine_ipv4_gateways_rejected_before_probing() {
    let err = run_trace(
        Config {
            ip_version: tracehop::IpVersion::V4,
            gateways: (1..=9).map(|i| format!("192.0.2.{i}")).collect(),
            ..config(vec![ProbeProtocol::Udp])
        },
        CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        TraceError::Config(ConfigError::TooManyGateways {
            count: 9,
            max: 8,
            ..
        })
    ));
}
