use chrono::Utc;
use rand::Rng;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, IpVersion, ProbeProtocol};
use crate::error::TraceError;
use crate::probe::{NullTransport, ProbeBuilder, RawTransport, Transport, local_addr_for};
use crate::state::SessionResult;
use crate::trace::pending::{ProbeRecord, SharedTables, TraceTables};
use crate::trace::receiver::{ReceiverConfig, spawn_receiver};

/// How often hop evaluation re-checks the shared tables
const EVALUATION_POLL: Duration = Duration::from_millis(10);

/// Range for randomly chosen TCP source ports
const EPHEMERAL_PORTS: std::ops::Range<u16> = 32768..61000;

/// Orchestrator state, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceState {
    Init,
    Probing { ttl: u8 },
    HopEvaluated { ttl: u8 },
    TerminatedReached { ttl: u8 },
    TerminatedExhausted,
    Cancelled,
    Closed,
}

/// Destination and source route resolved to addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Destination as given in the config
    pub host: String,
    pub address: IpAddr,
    /// Gateway addresses, empty when source routing is off
    pub route: Vec<IpAddr>,
}

impl ResolvedTarget {
    /// Target for an address literal without source route
    pub fn from_addr(address: IpAddr) -> Self {
        Self {
            host: address.to_string(),
            address,
            route: Vec::new(),
        }
    }
}

async fn resolve_host(host: &str, version: IpVersion) -> Result<IpAddr, TraceError> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return Ok(addr);
    }

    let resolve_err = |reason: String| TraceError::Resolve {
        host: host.to_string(),
        reason,
    };
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| resolve_err(e.to_string()))?
        .map(|sa| sa.ip())
        .collect();

    let preferred = match version {
        IpVersion::Auto | IpVersion::V4 => addrs.iter().find(|a| a.is_ipv4()),
        IpVersion::V6 => addrs.iter().find(|a| a.is_ipv6()),
    };
    // A family mismatch is reported by validation with a clearer message
    preferred
        .or(addrs.first())
        .copied()
        .ok_or_else(|| resolve_err("no addresses found".to_string()))
}

/// Validate the config and resolve the destination and gateways once.
///
/// A gateway that fails to resolve disables source routing for the session.
pub async fn resolve_target(config: &Config) -> Result<ResolvedTarget, TraceError> {
    config.validate()?;

    let address = resolve_host(&config.destination, config.ip_version).await?;
    let family = IpVersion::of(address);

    let mut route = Vec::with_capacity(config.gateways.len());
    for gateway in &config.gateways {
        match resolve_host(gateway, family).await {
            Ok(addr) if IpVersion::of(addr) == family => route.push(addr),
            Ok(addr) => {
                warn!(%gateway, %addr, "gateway family differs from destination, source routing disabled");
                route.clear();
                break;
            }
            Err(e) => {
                warn!(%gateway, error = %e, "gateway did not resolve, source routing disabled");
                route.clear();
                break;
            }
        }
    }

    config.validate_for(address)?;
    debug!(host = %config.destination, %address, ?route, "target resolved");

    Ok(ResolvedTarget {
        host: config.destination.clone(),
        address,
        route,
    })
}

/// Drives one tracing session: probes TTL by TTL and evaluates each hop
pub struct Tracer {
    config: Config,
    target: ResolvedTarget,
    transport: Arc<dyn Transport>,
    builder: ProbeBuilder,
    tables: SharedTables,
    cancel: CancellationToken,
    receiver_cancel: CancellationToken,
    receiver: Option<JoinHandle<anyhow::Result<()>>>,
    sequences: HashMap<ProbeProtocol, u16>,
    state: TraceState,
}

impl Tracer {
    /// Set up a session over a caller-supplied transport
    pub fn with_transport(
        config: Config,
        target: ResolvedTarget,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Result<Self, TraceError> {
        config.validate_for(target.address)?;

        let source = config
            .source_ip
            .unwrap_or_else(|| local_addr_for(target.address));
        let tcp_src_port = config
            .src_port
            .unwrap_or_else(|| rand::thread_rng().gen_range(EPHEMERAL_PORTS));
        let builder = ProbeBuilder::new(
            &config,
            target.address,
            &target.route,
            source,
            rand::random(),
            tcp_src_port,
        );
        let tables = TraceTables::shared(target.address, config.show_extensions);
        let receiver_cancel = cancel.child_token();

        Ok(Self {
            config,
            target,
            transport,
            builder,
            tables,
            cancel,
            receiver_cancel,
            receiver: None,
            sequences: HashMap::new(),
            state: TraceState::Init,
        })
    }

    /// Shared correlation state, for observing a running session
    pub fn tables(&self) -> SharedTables {
        Arc::clone(&self.tables)
    }

    pub fn builder(&self) -> &ProbeBuilder {
        &self.builder
    }

    fn transition(&mut self, next: TraceState) {
        debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    fn next_sequence(&mut self, protocol: ProbeProtocol) -> u16 {
        let counter = self.sequences.entry(protocol).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Sleep unless cancelled first. Returns false on cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        if delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Run the session to completion
    pub async fn run(mut self) -> Result<SessionResult, TraceError> {
        let started_at = Utc::now();
        info!(
            destination = %self.target.host,
            address = %self.target.address,
            protocols = ?self.config.protocols,
            first_ttl = self.config.first_ttl,
            max_hops = self.config.max_hops,
            simulate = self.config.simulate,
            "starting trace"
        );

        if !self.config.simulate {
            self.receiver = Some(spawn_receiver(
                Arc::clone(&self.transport),
                Arc::clone(&self.tables),
                self.receiver_cancel.clone(),
                ReceiverConfig {
                    timeout: self.config.timeout,
                    filter: self.builder.reply_filter(),
                },
            ));
        }

        let outcome = self.probe_all().await;
        let closed = self.close().await;
        let final_state = outcome?;
        closed?;

        let hops = self.tables.lock().hops.hops().to_vec();
        let reached = hops.iter().any(|h| h.reached());

        Ok(SessionResult {
            destination: self.target.host,
            address: self.target.address,
            protocols: self.config.protocols,
            ip_version: IpVersion::of(self.target.address),
            started_at,
            hops,
            reached,
            cancelled: final_state == TraceState::Cancelled,
            simulated: self.config.simulate,
        })
    }

    /// Walk the TTL range. Returns the terminal state.
    async fn probe_all(&mut self) -> Result<TraceState, TraceError> {
        for ttl in self.config.ttl_range() {
            self.transition(TraceState::Probing { ttl });

            let Some(last_send) = self.probe_hop(ttl).await else {
                self.tables.lock().expire_ttl(ttl);
                self.transition(TraceState::Cancelled);
                return Ok(self.state);
            };

            if !self.evaluate_hop(ttl, last_send).await? {
                self.tables.lock().expire_ttl(ttl);
                self.transition(TraceState::Cancelled);
                return Ok(self.state);
            }
            self.transition(TraceState::HopEvaluated { ttl });

            if self.tables.lock().reached(ttl) {
                info!(ttl, "destination reached");
                self.transition(TraceState::TerminatedReached { ttl });
                return Ok(self.state);
            }
        }

        self.transition(TraceState::TerminatedExhausted);
        Ok(self.state)
    }

    /// Send every probe of one TTL. Returns the time of the last send, or
    /// None when cancelled.
    async fn probe_hop(&mut self, ttl: u8) -> Option<Instant> {
        let mut last_send = Instant::now();
        let protocols = self.config.protocols.clone();

        for series in 1..=self.config.series_count {
            for &protocol in &protocols {
                for _ in 0..self.config.queries {
                    if self.cancel.is_cancelled() {
                        return None;
                    }

                    let sequence = self.next_sequence(protocol);
                    let probe = self.builder.build(protocol, sequence, ttl);
                    let record = ProbeRecord {
                        ttl,
                        series,
                        protocol,
                        sequence,
                        key: probe.key,
                        sent_at: Instant::now(),
                        matched: false,
                    };

                    // Registered before sending so a fast reply finds its record
                    if !self.tables.lock().register(record) {
                        warn!(ttl, %protocol, sequence, key = ?probe.key, "correlation key already in use, probe skipped");
                        continue;
                    }

                    if self.config.simulate {
                        self.tables.lock().resolve_simulated(&probe.key);
                    } else {
                        if let Err(e) = self.transport.send(&probe) {
                            self.tables.lock().discard(&probe.key);
                            warn!(ttl, %protocol, sequence, error = %e, "failed to send probe");
                            continue;
                        }
                        self.tables.lock().record_sent(ttl, protocol);
                    }
                    last_send = Instant::now();

                    if !self.pause(self.config.interval).await {
                        return None;
                    }
                }
            }

            if !self.pause(self.config.series_interval).await {
                return None;
            }
        }

        Some(last_send)
    }

    /// Wait until every probe of the hop is answered or the timeout after
    /// the last send elapses. Returns false on cancellation.
    async fn evaluate_hop(&mut self, ttl: u8, last_send: Instant) -> Result<bool, TraceError> {
        let deadline = last_send + self.config.timeout;

        loop {
            if self.tables.lock().hop_settled(ttl) {
                break;
            }

            if self.receiver.as_ref().is_some_and(|h| h.is_finished()) {
                return Err(self.receiver_failure());
            }

            if Instant::now() >= deadline {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(EVALUATION_POLL) => {}
            }
        }

        let expired = self.tables.lock().expire_ttl(ttl);
        if expired > 0 {
            debug!(ttl, expired, "unanswered probes timed out");
        }
        Ok(true)
    }

    /// Collect the error of a receiver that stopped on its own
    fn receiver_failure(&mut self) -> TraceError {
        match self.receiver.take().map(JoinHandle::join) {
            Some(Ok(Err(e))) => TraceError::Receiver(e.to_string()),
            Some(Err(_)) => TraceError::Receiver("receiver thread panicked".to_string()),
            _ => TraceError::Receiver("receiver stopped unexpectedly".to_string()),
        }
    }

    /// Stop and join the receiver, then drop the transport
    async fn close(&mut self) -> Result<(), TraceError> {
        self.receiver_cancel.cancel();

        let mut result = Ok(());
        if let Some(handle) = self.receiver.take() {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => result = Err(TraceError::Receiver(e.to_string())),
                Ok(Err(_)) | Err(_) => {
                    result = Err(TraceError::Receiver("receiver thread panicked".to_string()))
                }
            }
        }

        // Sockets close once the last transport handle goes away
        self.transport = Arc::new(NullTransport);
        self.transition(TraceState::Closed);
        result
    }
}

/// Resolve, open raw sockets (none when simulating) and run one session
pub async fn run_trace(
    config: Config,
    cancel: CancellationToken,
) -> Result<SessionResult, TraceError> {
    let target = resolve_target(&config).await?;

    let transport: Arc<dyn Transport> = if config.simulate {
        Arc::new(NullTransport)
    } else {
        Arc::new(RawTransport::open(&config, target.address, &target.route)?)
    };

    Tracer::with_transport(config, target, transport, cancel)?
        .run()
        .await
}
