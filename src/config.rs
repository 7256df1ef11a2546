use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::probe::port_capacity;

/// Maximum gateways in an IPv4 loose source route option
pub const MAX_LSRR_GATEWAYS: usize = 8;
/// Maximum gateways in an IPv6 type-0 routing header
pub const MAX_RTHDR_GATEWAYS: usize = 127;
/// Number of distinct ICMP echo sequence numbers per session
pub const ICMP_SEQUENCE_CAPACITY: u64 = 65535;

/// Probe protocol type
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProbeProtocol {
    #[default]
    Udp,
    Tcp,
    Icmp,
}

impl ProbeProtocol {
    /// Whether replies are correlated through the destination port
    pub fn is_port_based(self) -> bool {
        matches!(self, ProbeProtocol::Udp | ProbeProtocol::Tcp)
    }
}

impl fmt::Display for ProbeProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeProtocol::Udp => "udp",
            ProbeProtocol::Tcp => "tcp",
            ProbeProtocol::Icmp => "icmp",
        };
        f.write_str(name)
    }
}

impl FromStr for ProbeProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(ProbeProtocol::Udp),
            "tcp" => Ok(ProbeProtocol::Tcp),
            "icmp" => Ok(ProbeProtocol::Icmp),
            other => Err(format!("unknown protocol: {other} (use udp, tcp or icmp)")),
        }
    }
}

/// Address family preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpVersion {
    /// Whatever the destination resolves to, IPv4 preferred
    #[default]
    Auto,
    V4,
    V6,
}

impl IpVersion {
    /// Family of a concrete address
    pub fn of(addr: IpAddr) -> Self {
        if addr.is_ipv4() { IpVersion::V4 } else { IpVersion::V6 }
    }
}

/// Session configuration, validated before the first probe is built
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Destination host name or IP literal
    pub destination: String,
    pub ip_version: IpVersion,
    /// Protocols probed at every TTL, in order
    pub protocols: Vec<ProbeProtocol>,
    /// TTL of the first probed hop
    pub first_ttl: u8,
    /// Number of TTLs to probe starting at `first_ttl`
    pub max_hops: u8,
    /// Probes per protocol per series
    pub queries: u16,
    /// Series per hop
    pub series_count: u16,
    /// Minimum delay between two probes
    #[serde(with = "duration_serde")]
    pub interval: Duration,
    /// Delay after each series
    #[serde(with = "duration_serde")]
    pub series_interval: Duration,
    /// How long a probe may stay unanswered before it counts as lost
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Destination port base for UDP/TCP probes
    pub port: u16,
    /// Source port for UDP/TCP probes (kernel-chosen for UDP when unset)
    pub src_port: Option<u16>,
    /// Source address for outgoing probes
    pub source_ip: Option<IpAddr>,
    /// IPv4 ToS / IPv6 traffic class
    pub tos: u8,
    pub dont_fragment: bool,
    /// Loose source route gateways (host names or IP literals)
    pub gateways: Vec<String>,
    /// ICMP echo message length including its 8-byte header; UDP payload
    /// length
    pub packet_size: u16,
    /// Register and record probes without putting anything on the wire
    pub simulate: bool,
    /// Attach decoded ICMP extensions (MPLS) to hop results
    pub show_extensions: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            destination: String::new(),
            ip_version: IpVersion::Auto,
            protocols: vec![ProbeProtocol::Udp],
            first_ttl: 1,
            max_hops: 30,
            queries: 3,
            series_count: 1,
            interval: Duration::ZERO,
            series_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
            port: 33434,
            src_port: None,
            source_ip: None,
            tos: 0,
            dont_fragment: false,
            gateways: Vec::new(),
            packet_size: 64,
            simulate: false,
            show_extensions: false,
        }
    }
}

impl Config {
    /// Config for a destination with all other fields defaulted
    pub fn for_destination(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Self::default()
        }
    }

    /// Last TTL probed (inclusive)
    pub fn last_ttl(&self) -> u8 {
        let last = self.first_ttl as u16 + self.max_hops as u16 - 1;
        last.min(255) as u8
    }

    /// Iterate the TTL range in probing order
    pub fn ttl_range(&self) -> std::ops::RangeInclusive<u8> {
        self.first_ttl..=self.last_ttl()
    }

    /// Probes issued per protocol at a single TTL
    pub fn probes_per_hop(&self) -> u64 {
        self.queries as u64 * self.series_count as u64
    }

    /// Worst-case number of probes a protocol sends over the whole session
    pub fn probes_per_protocol(&self) -> u64 {
        let occurrences = |p: ProbeProtocol| self.protocols.iter().filter(|&&q| q == p).count();
        let max_occurrences = self
            .protocols
            .iter()
            .map(|&p| occurrences(p))
            .max()
            .unwrap_or(0) as u64;
        self.max_hops as u64 * self.probes_per_hop() * max_occurrences
    }

    /// Validate everything that does not depend on name resolution
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocols.is_empty() {
            return Err(ConfigError::EmptyProtocolSequence);
        }
        if self.first_ttl == 0 {
            return Err(ConfigError::InvalidFirstTtl(self.first_ttl));
        }
        if self.max_hops == 0 || self.first_ttl as u16 + self.max_hops as u16 - 1 > 255 {
            return Err(ConfigError::InvalidTtlRange {
                first_ttl: self.first_ttl,
                max_hops: self.max_hops,
            });
        }
        if self.queries == 0 {
            return Err(ConfigError::ZeroCount("queries per hop"));
        }
        if self.series_count == 0 {
            return Err(ConfigError::ZeroCount("series count"));
        }
        if self.port == 0 && self.protocols.iter().any(|p| p.is_port_based()) {
            return Err(ConfigError::InvalidPortBase);
        }

        // Gateway limits are checked before any resolution or packet building
        let (max, kind) = match self.ip_version {
            IpVersion::V4 => (MAX_LSRR_GATEWAYS, "IPv4 LSRR"),
            IpVersion::V6 | IpVersion::Auto => (MAX_RTHDR_GATEWAYS, "IPv6 routing header"),
        };
        if self.gateways.len() > max {
            return Err(ConfigError::TooManyGateways {
                kind,
                count: self.gateways.len(),
                max,
            });
        }

        self.check_probe_space()
    }

    /// Validate against the resolved destination address
    pub fn validate_for(&self, destination: IpAddr) -> Result<(), ConfigError> {
        self.validate()?;

        let expected = match self.ip_version {
            IpVersion::V4 if !destination.is_ipv4() => Some("IPv4"),
            IpVersion::V6 if !destination.is_ipv6() => Some("IPv6"),
            _ => None,
        };
        if let Some(expected) = expected {
            return Err(ConfigError::IpVersionMismatch {
                destination,
                expected,
            });
        }

        if destination.is_ipv4() && self.gateways.len() > MAX_LSRR_GATEWAYS {
            return Err(ConfigError::TooManyGateways {
                kind: "IPv4 LSRR",
                count: self.gateways.len(),
                max: MAX_LSRR_GATEWAYS,
            });
        }

        if let Some(source_ip) = self.source_ip
            && source_ip.is_ipv4() != destination.is_ipv4()
        {
            return Err(ConfigError::SourceFamilyMismatch { source_ip });
        }

        Ok(())
    }

    /// Every probe in a session must get its own correlation key
    fn check_probe_space(&self) -> Result<(), ConfigError> {
        let needed = self.probes_per_protocol();
        for &protocol in &self.protocols {
            let capacity = if protocol.is_port_based() {
                port_capacity(self.port)
            } else {
                ICMP_SEQUENCE_CAPACITY
            };
            if needed > capacity {
                return Err(ConfigError::ProbeSpaceExhausted {
                    protocol,
                    needed,
                    capacity,
                });
            }
        }
        Ok(())
    }
}

/// Serde helper for Duration (microseconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_micros() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = u64::deserialize(deserializer)?;
        Ok(Duration::from_micros(micros))
    }
}
