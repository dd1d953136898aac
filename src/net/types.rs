// Vigil Network Layer — Constants and Types
// Copyright (c) 2025-2026 The Vigil Project Developers
// Distributed under the MIT software license.

//! Constants and shared types for the peer defense layer.
//!
//! # Design Goals
//!
//! 1. **Bounded memory usage** — every collection has an explicit size
//!    limit. An attacker cannot exhaust memory by sending many addresses,
//!    opening many sockets, or queueing many messages.
//!
//! 2. **DoS resistance** — per-peer rate limiting, discouragement, and
//!    connection caps bound what any single peer can cost us.
//!
//! 3. **Eclipse resistance** — netgroup diversity limits ensure no single
//!    /16-equivalent prefix can dominate the connection set.
//!
//! # What This Does NOT Protect Against
//!
//! - Sybil attacks across many netgroups (mitigated by the adaptive
//!   registration cooldown at the consensus layer)
//! - BGP-level traffic interception (a transport-layer concern)

use crate::types::{ip_to_netgroup, NetgroupKey};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

// =============================================================================
// CONNECTION LIMITS
// =============================================================================

/// Maximum total peer connections: 8 outbound + 117 inbound.
pub const MAX_PEERS: usize = 125;

/// Maximum outbound connections we initiate.
/// We choose these targets, so they anchor Eclipse resistance.
pub const MAX_OUTBOUND: usize = 8;

/// Maximum inbound connections. Inbound peers are untrusted — they may all
/// be Sybils until proven otherwise.
pub const MAX_INBOUND: usize = MAX_PEERS - MAX_OUTBOUND;

/// Max connections from one IP. 2 allows NAT users while keeping a single
/// IP to at most 2 of 125 slots.
pub const MAX_CONNECTIONS_PER_IP: usize = 2;

/// Max connections sharing one netgroup (/16-equivalent prefix).
/// To fill all outbound slots an attacker needs 4+ distinct netgroups.
pub const MAX_PEERS_PER_NETGROUP: usize = 2;

// =============================================================================
// EVICTION PROTECTION BUDGETS
// =============================================================================
// When inbound is full, the eviction scorer spares connections in these
// classes (see eviction.rs). The budgets must fit inside MAX_INBOUND;
// NetConfig::validate() enforces that at startup.

/// Lowest-latency peers spared from eviction.
pub const PROTECT_LOW_LATENCY: usize = 8;

/// Most recent successful discovery/entry relayers spared.
pub const PROTECT_ENTRY_RELAY: usize = 4;

/// Most recent successful payload relayers spared.
pub const PROTECT_PAYLOAD_RELAY: usize = 4;

// =============================================================================
// TIMING
// =============================================================================

/// Ping cadence; peers silent for 2× this are considered dead.
pub const PING_INTERVAL_SECS: u64 = 120;

/// An address never successfully connected within this horizon is terminal
/// and purged lazily on the next bucket-slot contention.
pub const TERMINAL_STALENESS_SECS: u64 = 30 * 24 * 60 * 60;

/// Maintenance task cadence (address expiry, discouragement decay,
/// window rollover checks).
pub const MAINTENANCE_INTERVAL_SECS: u64 = 60;

// =============================================================================
// DISCOURAGEMENT
// =============================================================================
// Soft, decaying penalty — never a permanent ban from this layer.

/// Score at which new connections from an address are refused.
pub const DISCOURAGEMENT_THRESHOLD: u32 = 100;

/// Score halves this often (applied lazily on read).
pub const DISCOURAGEMENT_HALF_LIFE_SECS: u64 = 3600;

/// Score added per rate-limit escalation.
pub const DISCOURAGEMENT_RATE_LIMIT_STEP: u32 = 20;

/// Score added per integrity error (malformed address, bad proof).
pub const DISCOURAGEMENT_INTEGRITY_STEP: u32 = 34;

// =============================================================================
// NETWORK ADDRESS
// =============================================================================

/// A peer network address as the address book stores it.
///
/// `timestamp` is the last-seen time — self-reported by gossip, so only
/// used for freshness heuristics, never trusted for anything else.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct NetAddress {
    pub ip: IpAddr,
    pub port: u16,
    /// Last known activity (untrusted, heuristic only).
    pub timestamp: u64,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port, timestamp: crate::types::now() }
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn netgroup(&self) -> NetgroupKey {
        ip_to_netgroup(self.ip)
    }

    /// Check if the address is globally routable.
    ///
    /// Filters private, loopback, link-local, documentation, broadcast,
    /// multicast, and unspecified ranges. Prevents address-table pollution
    /// with unreachable entries.
    pub fn is_routable(&self) -> bool {
        match self.ip {
            IpAddr::V4(ip) => {
                !ip.is_private()
                    && !ip.is_loopback()
                    && !ip.is_link_local()
                    && !ip.is_broadcast()
                    && !ip.is_documentation()
                    && !ip.is_unspecified()
            }
            IpAddr::V6(ip) => {
                if ip.is_loopback() || ip.is_unspecified() || ip.is_multicast() {
                    return false;
                }

                let segments = ip.segments();

                // fc00::/7 — unique local (private IPv6)
                if (segments[0] & 0xfe00) == 0xfc00 {
                    return false;
                }

                // fe80::/10 — link-local
                if (segments[0] & 0xffc0) == 0xfe80 {
                    return false;
                }

                // 2001:db8::/32 — documentation
                if segments[0] == 0x2001 && segments[1] == 0x0db8 {
                    return false;
                }

                // ::ffff:0:0/96 — IPv4-mapped, check the embedded IPv4
                if segments[0] == 0 && segments[1] == 0 && segments[2] == 0
                    && segments[3] == 0 && segments[4] == 0 && segments[5] == 0xffff
                {
                    let ipv4 = std::net::Ipv4Addr::new(
                        (segments[6] >> 8) as u8,
                        segments[6] as u8,
                        (segments[7] >> 8) as u8,
                        segments[7] as u8,
                    );
                    return !ipv4.is_private()
                        && !ipv4.is_loopback()
                        && !ipv4.is_link_local()
                        && !ipv4.is_broadcast()
                        && !ipv4.is_documentation()
                        && !ipv4.is_unspecified();
                }

                true
            }
        }
    }
}

// =============================================================================
// ADDRESS INFO
// =============================================================================

/// Address-book entry with connection history.
///
/// Carries the "terrible address" heuristic used to deprioritize addresses
/// that consistently fail, and the terminal-staleness check used to purge
/// slots lazily on contention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressInfo {
    pub addr: NetAddress,
    /// Timestamp of last successful connection (0 = never).
    pub last_success: u64,
    /// Timestamp of last connection attempt (0 = never).
    pub last_attempt: u64,
    /// Consecutive failed attempts since last success.
    pub attempts: u32,
    /// Which peer told us about this address.
    pub source: Option<SocketAddr>,
}

impl AddressInfo {
    pub fn new(addr: NetAddress, source: Option<SocketAddr>) -> Self {
        Self { addr, last_success: 0, last_attempt: 0, attempts: 0, source }
    }

    pub fn mark_attempt(&mut self) {
        self.last_attempt = crate::types::now();
        self.attempts += 1;
    }

    pub fn mark_success(&mut self) {
        self.last_success = crate::types::now();
        self.addr.timestamp = self.last_success;
        self.attempts = 0;
    }

    /// Deprioritize this address during selection.
    ///
    /// An address is "terrible" if:
    /// - its timestamp is in the future (> 10 min skew) — gossip poisoning,
    /// - it was tried in the last 60s and failed 3+ times,
    /// - it never succeeded and failed 3+ times,
    /// - its last contact is over 30 days old.
    pub fn is_terrible(&self, now: u64) -> bool {
        if self.addr.timestamp > now.saturating_add(600) {
            return true;
        }

        if self.last_attempt > 0 && self.last_attempt > now.saturating_sub(60) {
            return self.attempts >= 3;
        }

        if self.last_success == 0 && self.attempts >= 3 {
            return true;
        }

        if self.addr.timestamp < now.saturating_sub(TERMINAL_STALENESS_SECS) {
            return true;
        }

        false
    }

    /// Terminal: never connected successfully within the staleness window.
    /// Purged lazily on slot contention, never by proactive scan.
    pub fn is_terminally_stale(&self, now: u64) -> bool {
        let freshest = self.last_success.max(self.addr.timestamp);
        freshest < now.saturating_sub(TERMINAL_STALENESS_SECS)
    }

    /// Relative selection weight (higher = more likely to be picked).
    pub fn select_chance(&self, now: u64) -> f64 {
        let mut chance = 1.0f64;

        // Deprioritize recent attempts so we spread probes around
        if self.last_attempt > 0 && self.last_attempt > now.saturating_sub(600) {
            chance *= 0.01;
        }

        // Halve per consecutive failure, floor at 0.2%
        chance *= 0.66f64.powi(self.attempts.min(8) as i32);

        chance.max(0.002)
    }
}
