// Vigil Network Layer — Peer State
// Copyright (c) 2025-2026 The Vigil Project Developers
// Distributed under the MIT software license.

//! Per-connection peer state.
//!
//! Each open socket gets one [`Peer`], owned by its connection task. The
//! rate limiter and flow control live inside it, so charging a message
//! never touches another peer's state. [`PeerInfo`] is the cheap snapshot
//! the eviction scorer works on.

use crate::net::rate_limit::{FlowControl, PeerRateLimits, RateLimitConfig};
use crate::net::types::PING_INTERVAL_SECS;
use crate::types::{ip_to_netgroup, NetgroupKey};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Misbehavior score at which a peer should be dropped and discouraged.
pub const MISBEHAVIOR_THRESHOLD: u32 = 100;

/// State for one open connection.
#[derive(Debug)]
pub struct Peer {
    pub addr: SocketAddr,
    /// Inbound connections are untrusted; outbound ones we chose.
    pub inbound: bool,
    pub netgroup: NetgroupKey,
    pub connected_at: Instant,

    /// Best observed round-trip time.
    pub min_ping: Option<Duration>,
    /// Outstanding ping, if any: (nonce, sent-at).
    pending_ping: Option<(u64, Instant)>,
    last_ping_at: Option<Instant>,

    /// Unix time of the last ledger-entry payload this peer relayed to us.
    pub last_entry_time: u64,
    /// Unix time of the last presence proof this peer relayed to us.
    pub last_presence_time: u64,

    misbehavior: u32,

    pub rate_limits: PeerRateLimits,
    pub flow_control: FlowControl,
}

impl Peer {
    pub fn new(addr: SocketAddr, inbound: bool, limits: &RateLimitConfig) -> Self {
        Self {
            addr,
            inbound,
            netgroup: ip_to_netgroup(addr.ip()),
            connected_at: Instant::now(),
            min_ping: None,
            pending_ping: None,
            last_ping_at: None,
            last_entry_time: 0,
            last_presence_time: 0,
            misbehavior: 0,
            rate_limits: PeerRateLimits::new(limits),
            flow_control: FlowControl::new(),
        }
    }

    /// A ping is due when none is outstanding and the last one is stale.
    pub fn needs_ping(&self) -> bool {
        if self.pending_ping.is_some() {
            return false;
        }
        match self.last_ping_at {
            None => true,
            Some(at) => at.elapsed() >= Duration::from_secs(PING_INTERVAL_SECS),
        }
    }

    pub fn start_ping(&mut self, nonce: u64) {
        let now = Instant::now();
        self.pending_ping = Some((nonce, now));
        self.last_ping_at = Some(now);
    }

    /// Complete an outstanding ping. A nonce mismatch is ignored (stale or
    /// forged pong), not an error.
    pub fn complete_ping(&mut self, nonce: u64) {
        if let Some((expected, sent_at)) = self.pending_ping {
            if expected == nonce {
                let rtt = sent_at.elapsed();
                self.min_ping = Some(match self.min_ping {
                    Some(best) => best.min(rtt),
                    None => rtt,
                });
                self.pending_ping = None;
            } else {
                debug!(addr = %self.addr, "pong nonce mismatch, ignoring");
            }
        }
    }

    /// Outstanding ping unanswered for 2× the ping interval.
    pub fn ping_timed_out(&self) -> bool {
        self.pending_ping
            .is_some_and(|(_, sent_at)| sent_at.elapsed() >= Duration::from_secs(2 * PING_INTERVAL_SECS))
    }

    pub fn record_entry_relay(&mut self) {
        self.last_entry_time = crate::types::now();
    }

    pub fn record_presence_relay(&mut self) {
        self.last_presence_time = crate::types::now();
    }

    /// Raise the misbehavior score. Returns true when the peer crosses the
    /// threshold and should be dropped + discouraged.
    pub fn misbehaving(&mut self, score: u32, reason: &str) -> bool {
        self.misbehavior = self.misbehavior.saturating_add(score);
        if self.misbehavior >= MISBEHAVIOR_THRESHOLD {
            warn!(addr = %self.addr, score = self.misbehavior, reason, "peer misbehaving, dropping");
            true
        } else {
            debug!(addr = %self.addr, score = self.misbehavior, reason, "peer misbehavior noted");
            false
        }
    }

    pub fn misbehavior_score(&self) -> u32 {
        self.misbehavior
    }
}

/// Immutable snapshot for the eviction scorer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub inbound: bool,
    pub netgroup: NetgroupKey,
    pub connected_at: Instant,
    pub min_ping: Option<Duration>,
    pub last_entry_time: u64,
    pub last_presence_time: u64,
}

impl From<&Peer> for PeerInfo {
    fn from(peer: &Peer) -> Self {
        Self {
            addr: peer.addr,
            inbound: peer.inbound,
            netgroup: peer.netgroup,
            connected_at: peer.connected_at,
            min_ping: peer.min_ping,
            last_entry_time: peer.last_entry_time,
            last_presence_time: peer.last_presence_time,
        }
    }
}
