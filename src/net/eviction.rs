// Vigil Network Layer — Inbound Eviction
// Copyright (c) 2025-2026 The Vigil Project Developers
// Distributed under the MIT software license.

//! Inbound eviction scoring.
//!
//! When the inbound slots are full, a new connection may only displace an
//! existing one that no protection class covers. The classes exist so an
//! attacker opening many fresh connections cannot push out the peers that
//! actually matter:
//!
//! 1. **Netgroup representatives** — the sole connection from an otherwise
//!    unrepresented netgroup. Evicting it would let one prefix monopolize
//!    the slots (Eclipse pressure).
//! 2. **Low latency** — the top [`PROTECT_LOW_LATENCY`] peers by best
//!    round-trip time. Attackers routing through relays can rarely match
//!    nearby honest peers.
//! 3. **Recent relay activity** — the most recent successful ledger-entry
//!    and presence relayers ([`PROTECT_ENTRY_RELAY`] / [`PROTECT_PAYLOAD_RELAY`]
//!    each). Useful peers are not churned out by idle ones.
//! 4. **Longevity** — the longest-connected half of whatever remains.
//!    Connection age is the one thing a new attacker cannot fake.
//!
//! Among the still-evictable, the youngest connection with the worst ping
//! goes first — exactly the profile of a fresh flood connection.
//!
//! Outbound connections are never eviction candidates; we chose them.

use crate::net::peer::PeerInfo;
use crate::net::types::{PROTECT_ENTRY_RELAY, PROTECT_LOW_LATENCY, PROTECT_PAYLOAD_RELAY};
use crate::types::NetgroupKey;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Aggregate view of one eviction decision, for operator counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvictionStats {
    pub candidates: usize,
    pub protected: usize,
    pub evictable: usize,
}

/// Pick the inbound connection to evict, or `None` if every candidate is
/// protected (the caller must then reject the new connection instead).
pub fn select_peer_to_evict(peers: &[PeerInfo]) -> Option<SocketAddr> {
    let (evictable, _) = partition(peers);

    evictable
        .into_iter()
        .max_by(|a, b| {
            // Youngest connection first (largest connected_at), then worst
            // ping. Unmeasured ping counts as worst.
            a.connected_at
                .cmp(&b.connected_at)
                .then_with(|| ping_or_max(a).cmp(&ping_or_max(b)))
        })
        .map(|p| p.addr)
}

/// Stats for the decision [`select_peer_to_evict`] would make.
pub fn eviction_stats(peers: &[PeerInfo]) -> EvictionStats {
    let candidates = peers.iter().filter(|p| p.inbound).count();
    let (evictable, protected) = partition(peers);
    EvictionStats { candidates, protected, evictable: evictable.len() }
}

fn ping_or_max(p: &PeerInfo) -> Duration {
    p.min_ping.unwrap_or(Duration::MAX)
}

/// Split inbound peers into (evictable, protected_count).
fn partition(peers: &[PeerInfo]) -> (Vec<&PeerInfo>, usize) {
    let inbound: Vec<&PeerInfo> = peers.iter().filter(|p| p.inbound).collect();
    if inbound.is_empty() {
        return (Vec::new(), 0);
    }

    let mut protected = vec![false; inbound.len()];

    // Class 1: sole representative of a netgroup
    let mut group_counts: HashMap<NetgroupKey, usize> = HashMap::new();
    for p in &inbound {
        *group_counts.entry(p.netgroup).or_insert(0) += 1;
    }
    for (i, p) in inbound.iter().enumerate() {
        if group_counts[&p.netgroup] == 1 {
            protected[i] = true;
        }
    }

    // Class 2: lowest-latency peers (only measured pings qualify)
    protect_top(&inbound, &mut protected, PROTECT_LOW_LATENCY, |p| {
        p.min_ping.map(|ping| std::cmp::Reverse(ping))
    });

    // Class 3: most recent relayers, entries and presences separately
    protect_top(&inbound, &mut protected, PROTECT_ENTRY_RELAY, |p| {
        (p.last_entry_time > 0).then_some(p.last_entry_time)
    });
    protect_top(&inbound, &mut protected, PROTECT_PAYLOAD_RELAY, |p| {
        (p.last_presence_time > 0).then_some(p.last_presence_time)
    });

    // Class 4: longest-lived half of the remainder
    let mut remaining: Vec<usize> = (0..inbound.len()).filter(|&i| !protected[i]).collect();
    remaining.sort_by_key(|&i| inbound[i].connected_at); // oldest first
    let keep = remaining.len() / 2;
    for &i in remaining.iter().take(keep) {
        protected[i] = true;
    }

    let protected_count = protected.iter().filter(|&&p| p).count();
    let evictable = inbound
        .iter()
        .enumerate()
        .filter(|(i, _)| !protected[*i])
        .map(|(_, p)| *p)
        .collect();
    (evictable, protected_count)
}

/// Mark the top `count` peers by `key` (highest first) as protected.
/// Peers mapping to `None` do not compete for the class.
fn protect_top<K: Ord>(
    inbound: &[&PeerInfo],
    protected: &mut [bool],
    count: usize,
    key: impl Fn(&PeerInfo) -> Option<K>,
) {
    let mut ranked: Vec<(usize, K)> = inbound
        .iter()
        .enumerate()
        .filter_map(|(i, p)| key(p).map(|k| (i, k)))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    for (i, _) in ranked.into_iter().take(count) {
        protected[i] = true;
    }
}
