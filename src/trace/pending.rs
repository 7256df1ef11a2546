//! Shared probe correlation state.
//!
//! The engine registers a record before each probe is sent and the receiver
//! resolves it when the matching reply arrives. Both sides go through one
//! mutex guarding the correlation table and the hop aggregator together, so
//! a record is resolved and its outcome recorded in the same critical
//! section.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::ProbeProtocol;
use crate::probe::ParsedReply;
use crate::state::{CorrelationKey, HopAggregator, HopResult, ProbeOutcome};

/// A probe that has been registered and possibly sent
#[derive(Debug, Clone)]
pub struct ProbeRecord {
    pub ttl: u8,
    pub series: u16,
    pub protocol: ProbeProtocol,
    /// Per-protocol sequence, 1-based
    pub sequence: u16,
    pub key: CorrelationKey,
    pub sent_at: Instant,
    pub matched: bool,
}

/// Every probe record of a session, indexed by key while unmatched
#[derive(Debug, Default)]
pub struct CorrelationTable {
    records: Vec<ProbeRecord>,
    unmatched: HashMap<CorrelationKey, usize>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record. Returns false, leaving the table untouched, when an
    /// unmatched record already holds the same key.
    pub fn register(&mut self, record: ProbeRecord) -> bool {
        if self.unmatched.contains_key(&record.key) {
            return false;
        }
        self.unmatched.insert(record.key, self.records.len());
        self.records.push(record);
        true
    }

    /// Unmatched record for `key`
    pub fn pending(&self, key: &CorrelationKey) -> Option<&ProbeRecord> {
        self.unmatched.get(key).map(|&index| &self.records[index])
    }

    /// Mark the unmatched record for `key` as matched. Later calls with the
    /// same key find nothing.
    pub fn resolve(&mut self, key: &CorrelationKey) -> Option<ProbeRecord> {
        let index = self.unmatched.remove(key)?;
        let record = &mut self.records[index];
        record.matched = true;
        Some(record.clone())
    }

    /// Forget a record whose probe never left the host
    pub fn discard(&mut self, key: &CorrelationKey) -> Option<ProbeRecord> {
        let index = self.unmatched.remove(key)?;
        let record = self.records.remove(index);
        for slot in self.unmatched.values_mut() {
            if *slot > index {
                *slot -= 1;
            }
        }
        Some(record)
    }

    /// Resolve every unmatched record selected by `predicate`
    fn resolve_where(&mut self, predicate: impl Fn(&ProbeRecord) -> bool) -> Vec<ProbeRecord> {
        let records = &mut self.records;
        let mut resolved = Vec::new();
        self.unmatched.retain(|_, &mut index| {
            let record = &mut records[index];
            if predicate(record) {
                record.matched = true;
                resolved.push(record.clone());
                false
            } else {
                true
            }
        });
        resolved.sort_by_key(|r| (r.ttl, r.sent_at));
        resolved
    }

    /// Resolve records sent more than `timeout` before `now`
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ProbeRecord> {
        self.resolve_where(|r| now.saturating_duration_since(r.sent_at) >= timeout)
    }

    /// Resolve every remaining record of `ttl`
    pub fn expire_ttl(&mut self, ttl: u8) -> Vec<ProbeRecord> {
        self.resolve_where(|r| r.ttl == ttl)
    }

    /// No record of `ttl` is waiting for a reply
    pub fn ttl_settled(&self, ttl: u8) -> bool {
        !self
            .unmatched
            .values()
            .any(|&index| self.records[index].ttl == ttl)
    }

    pub fn records(&self) -> &[ProbeRecord] {
        &self.records
    }

    /// Number of records not yet matched
    pub fn unmatched_len(&self) -> usize {
        self.unmatched.len()
    }
}

/// Correlation table and hop aggregator behind one lock
#[derive(Debug)]
pub struct TraceTables {
    pub table: CorrelationTable,
    pub hops: HopAggregator,
    destination: IpAddr,
}

/// Handle shared by the engine and the receiver thread
pub type SharedTables = Arc<Mutex<TraceTables>>;

impl TraceTables {
    pub fn new(destination: IpAddr, show_extensions: bool) -> Self {
        Self {
            table: CorrelationTable::new(),
            hops: HopAggregator::new(show_extensions),
            destination,
        }
    }

    pub fn shared(destination: IpAddr, show_extensions: bool) -> SharedTables {
        Arc::new(Mutex::new(Self::new(destination, show_extensions)))
    }

    pub fn register(&mut self, record: ProbeRecord) -> bool {
        self.table.register(record)
    }

    /// Count a probe that made it onto the wire
    pub fn record_sent(&mut self, ttl: u8, protocol: ProbeProtocol) {
        self.hops.record_sent(ttl, protocol);
    }

    /// Resolve a registered record as simulated
    pub fn resolve_simulated(&mut self, key: &CorrelationKey) -> bool {
        match self.table.resolve(key) {
            Some(record) => {
                self.hops.record_simulated(
                    record.ttl,
                    record.protocol,
                    ProbeOutcome::simulated(record.series, record.sequence),
                );
                true
            }
            None => false,
        }
    }

    /// Drop the record of a probe whose send failed
    pub fn discard(&mut self, key: &CorrelationKey) {
        self.table.discard(key);
    }

    /// Match a decoded reply received at `received_at` against the table.
    /// Returns the outcome recorded, or None when the reply matched nothing.
    pub fn match_reply(&mut self, reply: ParsedReply, received_at: Instant) -> Option<ProbeOutcome> {
        let Some(record) = self.table.pending(&reply.key) else {
            trace!(key = ?reply.key, responder = %reply.responder, "reply for unknown or resolved probe");
            return None;
        };

        if record.sequence != reply.sequence {
            debug!(
                expected = record.sequence,
                got = reply.sequence,
                "reply sequence does not match record"
            );
            return None;
        }
        if let Some(ack) = reply.tcp_ack
            && ack.wrapping_sub(1) != record.sequence as u32
        {
            debug!(ack, sequence = record.sequence, "TCP acknowledgment does not match probe");
            return None;
        }

        let record = self.table.resolve(&reply.key)?;
        let rtt = received_at.saturating_duration_since(record.sent_at);
        let reached = reply.responder == self.destination;
        let outcome = ProbeOutcome::reply(
            reply.responder,
            rtt,
            reached,
            record.series,
            record.sequence,
            reply.kind,
        );
        self.hops
            .record_outcome(record.ttl, record.protocol, outcome.clone(), reply.extensions);
        Some(outcome)
    }

    /// Turn records older than `timeout` into Timeout outcomes
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let expired = self.table.expire(now, timeout);
        self.record_timeouts(&expired)
    }

    /// Turn every remaining record of `ttl` into a Timeout outcome
    pub fn expire_ttl(&mut self, ttl: u8) -> usize {
        let expired = self.table.expire_ttl(ttl);
        self.record_timeouts(&expired)
    }

    fn record_timeouts(&mut self, expired: &[ProbeRecord]) -> usize {
        for record in expired {
            self.hops.record_outcome(
                record.ttl,
                record.protocol,
                ProbeOutcome::timeout(record.series, record.sequence),
                None,
            );
        }
        expired.len()
    }

    /// Every record of `ttl` is resolved
    pub fn hop_settled(&self, ttl: u8) -> bool {
        self.table.ttl_settled(ttl)
    }

    /// The destination answered a probe at `ttl`
    pub fn reached(&self, ttl: u8) -> bool {
        self.hops.hop(ttl).is_some_and(HopResult::reached)
    }
}
