//! Error types for trace sessions.
//!
//! Only conditions that abort the whole trace are errors. Lost probes are
//! reported as timeout outcomes, and undecodable packets are dropped.

use std::net::IpAddr;
use thiserror::Error;

use crate::config::ProbeProtocol;

/// Rejected session configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no probe protocol configured")]
    EmptyProtocolSequence,

    #[error("first TTL must be between 1 and 255, got {0}")]
    InvalidFirstTtl(u8),

    #[error("invalid TTL range: first={first_ttl}, max_hops={max_hops} (last TTL must not exceed 255)")]
    InvalidTtlRange { first_ttl: u8, max_hops: u8 },

    #[error("{0} must be at least 1")]
    ZeroCount(&'static str),

    #[error("destination port base must be non-zero")]
    InvalidPortBase,

    #[error("too many gateways for {kind}: {count} (max {max})")]
    TooManyGateways {
        kind: &'static str,
        count: usize,
        max: usize,
    },

    #[error("{protocol:?} probes would need {needed} distinct identifiers but only {capacity} are available")]
    ProbeSpaceExhausted {
        protocol: ProbeProtocol,
        needed: u64,
        capacity: u64,
    },

    #[error("destination {destination} is not an {expected} address")]
    IpVersionMismatch {
        destination: IpAddr,
        expected: &'static str,
    },

    #[error("source address {source_ip} does not match destination family")]
    SourceFamilyMismatch { source_ip: IpAddr },
}

/// Fatal trace error
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error(
        "insufficient permissions for raw {protocol:?} socket; run as root or grant CAP_NET_RAW"
    )]
    PermissionDenied {
        protocol: ProbeProtocol,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create {protocol:?} socket: {source}")]
    SocketCreation {
        protocol: ProbeProtocol,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to configure socket: {0}")]
    SocketOption(#[source] std::io::Error),

    #[error("receiver failed: {0}")]
    Receiver(String),
}

impl TraceError {
    /// Classify a socket creation failure, separating permission problems
    pub fn socket(protocol: ProbeProtocol, source: std::io::Error) -> Self {
        match source.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { protocol, source },
            _ => Self::SocketCreation { protocol, source },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let err = TraceError::socket(
            ProbeProtocol::Icmp,
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, TraceError::PermissionDenied { .. }));

        let err = TraceError::socket(
            ProbeProtocol::Udp,
            std::io::Error::from(std::io::ErrorKind::AddrInUse),
        );
        assert!(matches!(err, TraceError::SocketCreation { .. }));
    }

    #[test]
    fn test_config_error_message() {
        let err = TraceError::from(ConfigError::TooManyGateways {
            kind: "IPv4 LSRR",
            count: 9,
            max: 8,
        });
        assert_eq!(
            err.to_string(),
            "invalid configuration: too many gateways for IPv4 LSRR: 9 (max 8)"
        );
    }
}
