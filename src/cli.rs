use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;

use tracehop::{Config, IpVersion, ProbeProtocol};

/// Multi-protocol traceroute: ICMP echo, UDP and TCP SYN probes with
/// per-hop loss and RTT statistics
#[derive(Parser, Debug, Clone)]
#[command(name = "tracehop")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Destination host (IP address or hostname)
    #[arg(required = true)]
    pub host: String,

    /// ICMP echo length (header included) or UDP payload length, in bytes
    #[arg(long = "packet-size", default_value = "64")]
    pub packet_size: u16,

    /// Force IPv4
    #[arg(short = '4', conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Force IPv6
    #[arg(short = '6')]
    pub ipv6: bool,

    /// TTL of the first probed hop
    #[arg(short = 'f', long = "first", default_value = "1")]
    pub first_ttl: u8,

    /// Maximum number of hops probed
    #[arg(short = 'm', long = "max-hops", default_value = "30")]
    pub max_hops: u8,

    /// Probes per hop, per protocol and series
    #[arg(short = 'q', long = "queries", default_value = "3")]
    pub queries: u16,

    /// Series of probes per hop
    #[arg(long = "series-count", default_value = "1")]
    pub series_count: u16,

    /// Wait for a reply, in seconds
    #[arg(short = 'w', long = "wait", default_value = "5.0")]
    pub wait: f64,

    /// Minimum delay between probes, in milliseconds
    #[arg(short = 'z', long = "sendwait", default_value = "0")]
    pub sendwait: u64,

    /// Delay after each series, in milliseconds
    #[arg(long = "series-interval", default_value = "100")]
    pub series_interval: u64,

    /// Probe protocols in order, comma separated (udp, tcp, icmp)
    #[arg(short = 'P', long = "protocol", value_delimiter = ',')]
    pub protocols: Vec<ProbeProtocol>,

    /// Use ICMP echo probes (shortcut for -P icmp)
    #[arg(short = 'I', long = "icmp")]
    pub icmp: bool,

    /// Use TCP SYN probes (shortcut for -P tcp)
    #[arg(short = 'T', long = "tcp")]
    pub tcp: bool,

    /// Destination port base for UDP/TCP probes
    #[arg(short = 'p', long = "port", default_value = "33434")]
    pub port: u16,

    /// Source port for UDP/TCP probes
    #[arg(long = "sport")]
    pub src_port: Option<u16>,

    /// Source address for outgoing probes
    #[arg(short = 's', long = "source")]
    pub source: Option<IpAddr>,

    /// IPv4 type of service / IPv6 traffic class
    #[arg(short = 't', long = "tos", default_value = "0")]
    pub tos: u8,

    /// Set the Don't Fragment bit
    #[arg(short = 'F', long = "dont-fragment")]
    pub dont_fragment: bool,

    /// Loose source route gateway (repeatable)
    #[arg(short = 'g', long = "gateway")]
    pub gateways: Vec<String>,

    /// Register and record probes without sending anything
    #[arg(short = 'S', long = "simulate")]
    pub simulate: bool,

    /// Show ICMP extensions (MPLS label stacks)
    #[arg(short = 'e', long = "extensions")]
    pub extensions: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Args {
    /// Protocol sequence from -P, -I and -T; UDP when none is given
    fn protocol_sequence(&self) -> Vec<ProbeProtocol> {
        let mut protocols = self.protocols.clone();
        if self.icmp {
            protocols.push(ProbeProtocol::Icmp);
        }
        if self.tcp {
            protocols.push(ProbeProtocol::Tcp);
        }
        if protocols.is_empty() {
            protocols.push(ProbeProtocol::Udp);
        }
        protocols
    }

    /// Convert CLI args to a validated Config
    pub fn to_config(&self) -> Result<Config, String> {
        if !self.wait.is_finite() || self.wait <= 0.0 {
            return Err("Wait time must be positive".into());
        }

        let ip_version = match (self.ipv4, self.ipv6) {
            (true, _) => IpVersion::V4,
            (_, true) => IpVersion::V6,
            _ => IpVersion::Auto,
        };

        let config = Config {
            destination: self.host.clone(),
            ip_version,
            protocols: self.protocol_sequence(),
            first_ttl: self.first_ttl,
            max_hops: self.max_hops,
            queries: self.queries,
            series_count: self.series_count,
            interval: Duration::from_millis(self.sendwait),
            series_interval: Duration::from_millis(self.series_interval),
            timeout: Duration::from_secs_f64(self.wait),
            port: self.port,
            src_port: self.src_port,
            source_ip: self.source,
            tos: self.tos,
            dont_fragment: self.dont_fragment,
            gateways: self.gateways.clone(),
            packet_size: self.packet_size,
            simulate: self.simulate,
            show_extensions: self.extensions,
        };

        config.validate().map_err(|e| e.to_string())?;
        Ok(config)
    }
}
