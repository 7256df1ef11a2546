use anyhow::{Result, anyhow};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::probe::{
    InboundPacket, ReplyChannel, ReplyFilter, Transport, parse_icmp_reply, parse_tcp_reply,
};
use crate::trace::pending::SharedTables;

/// Maximum consecutive errors before stopping the receiver
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Longest wait for socket readiness per loop iteration
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Configuration for the receiver thread
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Probe timeout duration
    pub timeout: Duration,
    /// Recognises replies to this session's probes
    pub filter: ReplyFilter,
}

/// The receiver reads replies from the transport and correlates them to probes
pub struct Receiver {
    transport: Arc<dyn Transport>,
    tables: SharedTables,
    cancel: CancellationToken,
    config: ReceiverConfig,
    consecutive_errors: u32,
}

/// Errors that mean the socket itself is gone
fn is_fatal(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOTSOCK))
}

impl Receiver {
    pub fn new(
        transport: Arc<dyn Transport>,
        tables: SharedTables,
        cancel: CancellationToken,
        config: ReceiverConfig,
    ) -> Self {
        Self {
            transport,
            tables,
            cancel,
            config,
            consecutive_errors: 0,
        }
    }

    /// Run the receiver on a dedicated thread (blocking I/O)
    pub fn run_blocking(mut self) -> Result<()> {
        debug!("receiver started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.transport.recv(POLL_INTERVAL) {
                Ok(packets) => {
                    self.consecutive_errors = 0;
                    for packet in packets {
                        self.handle_packet(packet);
                    }
                }
                Err(e) if is_fatal(&e) => {
                    return Err(anyhow!("receive socket is no longer valid: {e}"));
                }
                Err(e) => {
                    self.consecutive_errors += 1;
                    warn!(
                        error = %e,
                        count = self.consecutive_errors,
                        max = MAX_CONSECUTIVE_ERRORS,
                        "receive error"
                    );
                    if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        return Err(anyhow!(
                            "receiver stopped: {} consecutive errors (last: {})",
                            self.consecutive_errors,
                            e
                        ));
                    }
                }
            }

            // Sweep after draining so queued replies are matched first
            let expired = self.tables.lock().expire(Instant::now(), self.config.timeout);
            if expired > 0 {
                trace!(expired, "probes timed out");
            }
        }

        debug!("receiver stopped");
        Ok(())
    }

    fn handle_packet(&self, packet: InboundPacket) {
        let parsed = match packet.channel {
            ReplyChannel::Icmp => {
                parse_icmp_reply(&packet.data, packet.responder, &self.config.filter)
            }
            ReplyChannel::Tcp => parse_tcp_reply(&packet.data, packet.responder, &self.config.filter),
        };
        let Some(parsed) = parsed else {
            return;
        };

        let key = parsed.key;
        let matched = self.tables.lock().match_reply(parsed, packet.received_at);
        if let Some(outcome) = matched {
            debug!(
                ?key,
                responder = ?outcome.responder,
                rtt_ms = ?outcome.rtt_ms,
                reached = outcome.reached,
                "reply matched"
            );
        }
    }
}

/// Spawn the receiver on a dedicated OS thread
pub fn spawn_receiver(
    transport: Arc<dyn Transport>,
    tables: SharedTables,
    cancel: CancellationToken,
    config: ReceiverConfig,
) -> std::thread::JoinHandle<Result<()>> {
    std::thread::spawn(move || {
        let receiver = Receiver::new(transport, tables, cancel, config);

        // Catch panics and convert to error with details
        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| receiver.run_blocking())) {
            Ok(result) => result,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(anyhow!("receiver panicked: {}", msg))
            }
        }
    })
}
