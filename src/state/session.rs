use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use crate::config::{IpVersion, ProbeProtocol};

/// Identifies an outstanding probe by what its reply will carry
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CorrelationKey {
    /// ICMP echo: session identifier and per-protocol sequence
    Echo { identifier: u16, sequence: u16 },
    /// UDP/TCP: encoded destination port
    Port { protocol: ProbeProtocol, port: u16 },
}

/// What kind of packet answered a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyKind {
    EchoReply,
    TimeExceeded(u8),
    DestUnreachable(u8),
    TcpSynAck,
    TcpReset,
}

/// How a probe was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    Reply,
    Timeout,
    Simulated,
}

/// Result of a single probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub kind: OutcomeKind,
    pub responder: Option<IpAddr>,
    /// Round-trip time in milliseconds
    pub rtt_ms: Option<f64>,
    /// The responder is the destination
    pub reached: bool,
    pub series: u16,
    pub sequence: u16,
    pub reply: Option<ReplyKind>,
}

impl ProbeOutcome {
    pub fn reply(
        responder: IpAddr,
        rtt: Duration,
        reached: bool,
        series: u16,
        sequence: u16,
        reply: ReplyKind,
    ) -> Self {
        Self {
            kind: OutcomeKind::Reply,
            responder: Some(responder),
            rtt_ms: Some(rtt.as_secs_f64() * 1000.0),
            reached,
            series,
            sequence,
            reply: Some(reply),
        }
    }

    pub fn timeout(series: u16, sequence: u16) -> Self {
        Self {
            kind: OutcomeKind::Timeout,
            responder: None,
            rtt_ms: None,
            reached: false,
            series,
            sequence,
            reply: None,
        }
    }

    pub fn simulated(series: u16, sequence: u16) -> Self {
        Self {
            kind: OutcomeKind::Simulated,
            ..Self::timeout(series, sequence)
        }
    }
}

/// MPLS label stack entry (RFC 4950)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MplsLabel {
    /// 20-bit label value
    pub label: u32,
    /// Traffic class (formerly EXP)
    pub exp: u8,
    /// Bottom of stack
    pub bottom: bool,
    pub ttl: u8,
}

impl MplsLabel {
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self {
            label: ((bytes[0] as u32) << 12) | ((bytes[1] as u32) << 4) | ((bytes[2] as u32) >> 4),
            exp: (bytes[2] >> 1) & 0x07,
            bottom: bytes[2] & 0x01 == 1,
            ttl: bytes[3],
        }
    }
}

/// ICMP extension object other than an MPLS label stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionObject {
    pub class: u8,
    pub c_type: u8,
    /// Object length including its 4-byte header
    pub length: u16,
}

/// Decoded RFC 4884 extension structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcmpExtensions {
    pub mpls: Vec<MplsLabel>,
    pub objects: Vec<ExtensionObject>,
}

impl IcmpExtensions {
    pub fn is_empty(&self) -> bool {
        self.mpls.is_empty() && self.objects.is_empty()
    }
}

/// Summary statistics for one protocol at one hop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolStats {
    pub sent: u64,
    pub responses: u64,
    /// Fraction of awaited probes that went unanswered (0.0..=1.0)
    pub loss: f64,
    pub min_ms: Option<f64>,
    pub avg_ms: Option<f64>,
    pub max_ms: Option<f64>,
}

/// Probes and outcomes for one protocol at one TTL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolHop {
    pub protocol: ProbeProtocol,
    pub sent: u64,
    /// Probes recorded without being put on the wire
    pub simulated: u64,
    pub outcomes: Vec<ProbeOutcome>,
}

impl ProtocolHop {
    pub fn new(protocol: ProbeProtocol) -> Self {
        Self {
            protocol,
            sent: 0,
            simulated: 0,
            outcomes: Vec::new(),
        }
    }

    pub fn responses(&self) -> u64 {
        self.outcomes
            .iter()
            .filter(|o| o.kind == OutcomeKind::Reply)
            .count() as u64
    }

    pub fn stats(&self) -> ProtocolStats {
        let responses = self.responses();
        let awaited = self.sent.saturating_sub(self.simulated);
        let loss = if awaited == 0 {
            0.0
        } else {
            awaited.saturating_sub(responses) as f64 / awaited as f64
        };

        let rtts: Vec<f64> = self.outcomes.iter().filter_map(|o| o.rtt_ms).collect();
        let (min_ms, avg_ms, max_ms) = if rtts.is_empty() {
            (None, None, None)
        } else {
            let min = rtts.iter().copied().fold(f64::INFINITY, f64::min);
            let max = rtts.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = rtts.iter().sum::<f64>() / rtts.len() as f64;
            (Some(min), Some(avg), Some(max))
        };

        ProtocolStats {
            sent: self.sent,
            responses,
            loss,
            min_ms,
            avg_ms,
            max_ms,
        }
    }
}

/// A single hop (TTL level) in the path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopResult {
    pub ttl: u8,
    /// One entry per protocol, in probing order
    pub protocols: Vec<ProtocolHop>,
    pub extensions: Option<IcmpExtensions>,
}

impl HopResult {
    pub fn new(ttl: u8) -> Self {
        Self {
            ttl,
            protocols: Vec::new(),
            extensions: None,
        }
    }

    pub fn protocol(&self, protocol: ProbeProtocol) -> Option<&ProtocolHop> {
        self.protocols.iter().find(|p| p.protocol == protocol)
    }

    pub fn protocol_mut(&mut self, protocol: ProbeProtocol) -> &mut ProtocolHop {
        let index = match self.protocols.iter().position(|p| p.protocol == protocol) {
            Some(index) => index,
            None => {
                self.protocols.push(ProtocolHop::new(protocol));
                self.protocols.len() - 1
            }
        };
        &mut self.protocols[index]
    }

    /// Any probe at this TTL got an answer from the destination
    pub fn reached(&self) -> bool {
        self.protocols
            .iter()
            .flat_map(|p| &p.outcomes)
            .any(|o| o.reached)
    }

    /// Distinct responders in the order they were first seen
    pub fn responders(&self) -> Vec<IpAddr> {
        let mut seen = Vec::new();
        for outcome in self.protocols.iter().flat_map(|p| &p.outcomes) {
            if let Some(ip) = outcome.responder
                && !seen.contains(&ip)
            {
                seen.push(ip);
            }
        }
        seen
    }

    fn merge_extensions(&mut self, extensions: IcmpExtensions) {
        let merged = self.extensions.get_or_insert_with(IcmpExtensions::default);
        for label in extensions.mpls {
            if !merged.mpls.contains(&label) {
                merged.mpls.push(label);
            }
        }
        for object in extensions.objects {
            if !merged.objects.contains(&object) {
                merged.objects.push(object);
            }
        }
    }
}

/// Per-hop, per-protocol accumulation of probe outcomes
#[derive(Debug, Clone, Default)]
pub struct HopAggregator {
    hops: Vec<HopResult>,
    show_extensions: bool,
}

impl HopAggregator {
    pub fn new(show_extensions: bool) -> Self {
        Self {
            hops: Vec::new(),
            show_extensions,
        }
    }

    pub fn hop(&self, ttl: u8) -> Option<&HopResult> {
        self.hops
            .binary_search_by_key(&ttl, |h| h.ttl)
            .ok()
            .map(|i| &self.hops[i])
    }

    /// Get the hop for `ttl`, creating it on first use
    pub fn hop_mut(&mut self, ttl: u8) -> &mut HopResult {
        let index = match self.hops.binary_search_by_key(&ttl, |h| h.ttl) {
            Ok(index) => index,
            Err(index) => {
                self.hops.insert(index, HopResult::new(ttl));
                index
            }
        };
        &mut self.hops[index]
    }

    /// Record a probe that went out on the wire
    pub fn record_sent(&mut self, ttl: u8, protocol: ProbeProtocol) {
        self.hop_mut(ttl).protocol_mut(protocol).sent += 1;
    }

    /// Record a simulated probe together with its outcome
    pub fn record_simulated(&mut self, ttl: u8, protocol: ProbeProtocol, outcome: ProbeOutcome) {
        let hop = self.hop_mut(ttl).protocol_mut(protocol);
        hop.sent += 1;
        hop.simulated += 1;
        hop.outcomes.push(outcome);
    }

    pub fn record_outcome(
        &mut self,
        ttl: u8,
        protocol: ProbeProtocol,
        outcome: ProbeOutcome,
        extensions: Option<IcmpExtensions>,
    ) {
        let show_extensions = self.show_extensions;
        let hop = self.hop_mut(ttl);
        hop.protocol_mut(protocol).outcomes.push(outcome);
        if show_extensions
            && let Some(extensions) = extensions
            && !extensions.is_empty()
        {
            hop.merge_extensions(extensions);
        }
    }

    pub fn hops(&self) -> &[HopResult] {
        &self.hops
    }

    pub fn into_hops(self) -> Vec<HopResult> {
        self.hops
    }
}

/// A complete tracing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResult {
    /// Destination as given by the caller
    pub destination: String,
    pub address: IpAddr,
    pub protocols: Vec<ProbeProtocol>,
    pub ip_version: IpVersion,
    pub started_at: DateTime<Utc>,
    /// Hops in TTL order
    pub hops: Vec<HopResult>,
    /// Some probe got an answer from the destination
    pub reached: bool,
    /// The session stopped on cancellation
    pub cancelled: bool,
    pub simulated: bool,
}

impl SessionResult {
    /// Get hop by TTL
    pub fn hop(&self, ttl: u8) -> Option<&HopResult> {
        self.hops.iter().find(|h| h.ttl == ttl)
    }

    /// TTL at which the destination answered
    pub fn destination_ttl(&self) -> Option<u8> {
        self.hops.iter().find(|h| h.reached()).map(|h| h.ttl)
    }

    /// Total probes issued across all hops and protocols
    pub fn total_sent(&self) -> u64 {
        self.hops
            .iter()
            .flat_map(|h| &h.protocols)
            .map(|p| p.sent)
            .sum()
    }
}
