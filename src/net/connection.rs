// Vigil Network Layer — Connection Set
// Copyright (c) 2025-2026 The Vigil Project Developers
// Distributed under the MIT software license.

//! The set of currently-open connections.
//!
//! Connections live in an owned arena indexed by stable
//! [`ConnId`] handles (index + generation) — external references are
//! handle pairs, never aliases into the arena, so a slot reused after
//! disconnect cannot be confused with its previous occupant.
//!
//! Admission enforces, in one critical section:
//! - discouragement (decaying soft ban),
//! - capacity (`MAX_INBOUND` / `MAX_OUTBOUND`),
//! - netgroup diversity (at most [`MAX_PEERS_PER_NETGROUP`] per
//!   /16-equivalent prefix, regardless of free slots),
//! - per-IP limit.
//!
//! All sections are short: lookups, counter updates, slot writes. Network
//! I/O never happens under the lock.

use crate::net::types::{
    DISCOURAGEMENT_HALF_LIFE_SECS, DISCOURAGEMENT_THRESHOLD, MAX_CONNECTIONS_PER_IP, MAX_INBOUND,
    MAX_OUTBOUND, MAX_PEERS_PER_NETGROUP, PROTECT_ENTRY_RELAY, PROTECT_LOW_LATENCY,
    PROTECT_PAYLOAD_RELAY,
};
use crate::types::{ip_to_netgroup, NetgroupKey};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConnConfigError {
    #[error("eviction protection budget ({budget}) must fit inside max_inbound ({max_inbound})")]
    ProtectionBudgetTooLarge { budget: usize, max_inbound: usize },
    #[error("connection limits must be non-zero")]
    ZeroLimit,
}

/// Admission failures. All recovered locally by rejecting the connection;
/// none are fatal (error taxonomy class 1).
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("address is discouraged")]
    Discouraged,
    #[error("at capacity and no evictable connection")]
    AtCapacity,
    #[error("netgroup already at limit")]
    NetgroupFull,
    #[error("per-IP limit reached")]
    IpFull,
}

/// Connection limits. Defaults are the mainnet constants.
#[derive(Debug, Clone)]
pub struct ConnConfig {
    pub max_outbound: usize,
    pub max_inbound: usize,
    pub max_per_netgroup: usize,
    pub max_per_ip: usize,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            max_outbound: MAX_OUTBOUND,
            max_inbound: MAX_INBOUND,
            max_per_netgroup: MAX_PEERS_PER_NETGROUP,
            max_per_ip: MAX_CONNECTIONS_PER_IP,
        }
    }
}

impl ConnConfig {
    /// Invariant check, fatal at startup: if the protection classes could
    /// cover every inbound slot, eviction would never find a candidate and
    /// the node would silently stop accepting peers.
    pub fn validate(&self) -> Result<(), ConnConfigError> {
        if self.max_outbound == 0
            || self.max_inbound == 0
            || self.max_per_netgroup == 0
            || self.max_per_ip == 0
        {
            return Err(ConnConfigError::ZeroLimit);
        }
        let budget = PROTECT_LOW_LATENCY + PROTECT_ENTRY_RELAY + PROTECT_PAYLOAD_RELAY;
        if budget >= self.max_inbound {
            return Err(ConnConfigError::ProtectionBudgetTooLarge {
                budget,
                max_inbound: self.max_inbound,
            });
        }
        Ok(())
    }
}

/// Stable handle to a connection slot. The generation detects stale
/// handles after slot reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: u32,
    generation: u32,
}

/// Arena bookkeeping for one connection. The full [`crate::net::peer::Peer`]
/// state is owned by the connection task; the set only tracks what
/// admission and release need.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    pub addr: SocketAddr,
    pub inbound: bool,
    pub netgroup: NetgroupKey,
    pub connected_at: Instant,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    meta: Option<ConnMeta>,
}

/// Aggregate counters for operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub inbound: usize,
    pub outbound: usize,
    pub netgroups: usize,
    pub discouraged: usize,
    pub evictions: u64,
    pub rejected_capacity: u64,
    pub rejected_netgroup: u64,
    pub rejected_ip: u64,
    pub rejected_discouraged: u64,
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    by_addr: HashMap<SocketAddr, ConnId>,
    netgroups: HashMap<NetgroupKey, usize>,
    per_ip: HashMap<IpAddr, usize>,
    inbound: usize,
    outbound: usize,
    discouraged: DiscouragedFilter,
    evictions: u64,
    rejected_capacity: u64,
    rejected_netgroup: u64,
    rejected_ip: u64,
    rejected_discouraged: u64,
}

pub struct ConnectionManager {
    config: ConnConfig,
    inner: RwLock<Inner>,
}

impl ConnectionManager {
    pub fn new(config: ConnConfig) -> Result<Self, ConnConfigError> {
        config.validate()?;
        Ok(Self { config, inner: RwLock::new(Inner::default()) })
    }

    pub fn with_defaults() -> Self {
        Self::new(ConnConfig::default()).expect("default connection config is valid")
    }

    pub fn config(&self) -> &ConnConfig {
        &self.config
    }

    /// Room for another inbound connection without eviction?
    pub async fn can_accept_inbound(&self) -> bool {
        self.inner.read().await.inbound < self.config.max_inbound
    }

    /// Another outbound connection wanted?
    pub async fn need_outbound(&self) -> bool {
        self.inner.read().await.outbound < self.config.max_outbound
    }

    /// Netgroup diversity check for a prospective connection.
    pub async fn can_connect(&self, addr: &SocketAddr) -> bool {
        let group = ip_to_netgroup(addr.ip());
        let inner = self.inner.read().await;
        inner.netgroups.get(&group).copied().unwrap_or(0) < self.config.max_per_netgroup
    }

    /// Per-IP limit check.
    pub async fn can_accept_from_ip(&self, addr: &SocketAddr) -> bool {
        let inner = self.inner.read().await;
        inner.per_ip.get(&addr.ip()).copied().unwrap_or(0) < self.config.max_per_ip
    }

    /// Admit a connection: every check plus the slot write in one critical
    /// section, so two racing accepts cannot both squeeze into the last
    /// slot. Capacity handling is the caller's job (run the eviction scorer
    /// first); this returns `AtCapacity` rather than evicting on its own.
    pub async fn try_add(&self, addr: SocketAddr, inbound: bool) -> Result<ConnId, AdmissionError> {
        let group = ip_to_netgroup(addr.ip());
        let mut inner = self.inner.write().await;

        if inner.discouraged.is_discouraged(addr.ip(), crate::types::now()) {
            inner.rejected_discouraged += 1;
            debug!(%addr, "rejecting discouraged peer");
            return Err(AdmissionError::Discouraged);
        }

        let at_capacity = if inbound {
            inner.inbound >= self.config.max_inbound
        } else {
            inner.outbound >= self.config.max_outbound
        };
        if at_capacity {
            inner.rejected_capacity += 1;
            debug!(%addr, inbound, "rejecting at capacity");
            return Err(AdmissionError::AtCapacity);
        }

        if inner.netgroups.get(&group).copied().unwrap_or(0) >= self.config.max_per_netgroup {
            inner.rejected_netgroup += 1;
            debug!(%addr, "rejecting, netgroup at limit");
            return Err(AdmissionError::NetgroupFull);
        }

        if inner.per_ip.get(&addr.ip()).copied().unwrap_or(0) >= self.config.max_per_ip {
            inner.rejected_ip += 1;
            debug!(%addr, "rejecting, per-IP limit");
            return Err(AdmissionError::IpFull);
        }

        let meta = ConnMeta { addr, inbound, netgroup: group, connected_at: Instant::now() };
        let id = match inner.free.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.meta = Some(meta);
                ConnId { index, generation: slot.generation }
            }
            None => {
                let index = inner.slots.len() as u32;
                inner.slots.push(Slot { generation: 0, meta: Some(meta) });
                ConnId { index, generation: 0 }
            }
        };

        if inbound {
            inner.inbound += 1;
        } else {
            inner.outbound += 1;
        }
        *inner.netgroups.entry(group).or_insert(0) += 1;
        *inner.per_ip.entry(addr.ip()).or_insert(0) += 1;
        inner.by_addr.insert(addr, id);

        Ok(id)
    }

    /// Release a connection slot. Synchronous with respect to the caller's
    /// task shutdown — once this returns there is no ghost entry. Stale
    /// handles (already released, slot reused) are a no-op.
    pub async fn remove(&self, id: ConnId) -> Option<ConnMeta> {
        let mut inner = self.inner.write().await;
        let slot = inner.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let meta = slot.meta.take()?;
        slot.generation = slot.generation.wrapping_add(1);

        if meta.inbound {
            inner.inbound -= 1;
        } else {
            inner.outbound -= 1;
        }
        if let Some(count) = inner.netgroups.get_mut(&meta.netgroup) {
            *count -= 1;
            if *count == 0 {
                inner.netgroups.remove(&meta.netgroup);
            }
        }
        if let Some(count) = inner.per_ip.get_mut(&meta.addr.ip()) {
            *count -= 1;
            if *count == 0 {
                inner.per_ip.remove(&meta.addr.ip());
            }
        }
        inner.by_addr.remove(&meta.addr);
        inner.free.push(id.index);
        Some(meta)
    }

    pub async fn remove_by_addr(&self, addr: &SocketAddr) -> Option<ConnMeta> {
        let id = { self.inner.read().await.by_addr.get(addr).copied() };
        match id {
            Some(id) => self.remove(id).await,
            None => None,
        }
    }

    /// Look up a live connection; stale generations return `None`.
    pub async fn get(&self, id: ConnId) -> Option<ConnMeta> {
        let inner = self.inner.read().await;
        let slot = inner.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.meta.clone()
    }

    pub async fn id_for(&self, addr: &SocketAddr) -> Option<ConnId> {
        self.inner.read().await.by_addr.get(addr).copied()
    }

    /// Record that the caller evicted `addr` to make room.
    pub async fn record_eviction(&self, addr: &SocketAddr) -> Option<ConnMeta> {
        let meta = self.remove_by_addr(addr).await;
        if meta.is_some() {
            let mut inner = self.inner.write().await;
            inner.evictions += 1;
            info!(%addr, "evicted inbound connection");
        }
        meta
    }

    /// Raise an address's discouragement score (decays on its own).
    pub async fn discourage(&self, addr: &SocketAddr, points: u32) {
        let mut inner = self.inner.write().await;
        let score = inner.discouraged.add(addr.ip(), points, crate::types::now());
        debug!(%addr, score, "peer discouraged");
    }

    pub async fn is_discouraged(&self, addr: &SocketAddr) -> bool {
        let mut inner = self.inner.write().await;
        inner.discouraged.is_discouraged(addr.ip(), crate::types::now())
    }

    /// Drop fully-decayed discouragement entries. Maintenance-task cadence.
    pub async fn prune_discouragement(&self) {
        let now = crate::types::now();
        self.inner.write().await.discouraged.prune(now);
    }

    pub async fn stats(&self) -> ConnectionStats {
        let inner = self.inner.read().await;
        ConnectionStats {
            inbound: inner.inbound,
            outbound: inner.outbound,
            netgroups: inner.netgroups.len(),
            discouraged: inner.discouraged.len(),
            evictions: inner.evictions,
            rejected_capacity: inner.rejected_capacity,
            rejected_netgroup: inner.rejected_netgroup,
            rejected_ip: inner.rejected_ip,
            rejected_discouraged: inner.rejected_discouraged,
        }
    }
}

// =============================================================================
// DISCOURAGEMENT
// =============================================================================

/// Decaying per-IP misbehavior score. Soft by construction: the score
/// halves every [`DISCOURAGEMENT_HALF_LIFE_SECS`], so even a maximally
/// discouraged address recovers in hours. Never a permanent ban.
#[derive(Debug, Default)]
pub struct DiscouragedFilter {
    scores: HashMap<IpAddr, (f64, u64)>, // (score, last_update unix secs)
}

impl DiscouragedFilter {
    /// Add points and return the decayed total.
    pub fn add(&mut self, ip: IpAddr, points: u32, now: u64) -> u32 {
        let entry = self.scores.entry(ip).or_insert((0.0, now));
        let decayed = Self::decay(entry.0, entry.1, now);
        *entry = (decayed + points as f64, now);
        entry.0 as u32
    }

    pub fn is_discouraged(&mut self, ip: IpAddr, now: u64) -> bool {
        match self.scores.get_mut(&ip) {
            Some(entry) => {
                entry.0 = Self::decay(entry.0, entry.1, now);
                entry.1 = now;
                entry.0 >= DISCOURAGEMENT_THRESHOLD as f64
            }
            None => false,
        }
    }

    pub fn prune(&mut self, now: u64) {
        self.scores.retain(|_, (score, at)| Self::decay(*score, *at, now) >= 1.0);
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    fn decay(score: f64, from: u64, now: u64) -> f64 {
        let elapsed = now.saturating_sub(from);
        score * 0.5f64.powf(elapsed as f64 / DISCOURAGEMENT_HALF_LIFE_SECS as f64)
    }
}
