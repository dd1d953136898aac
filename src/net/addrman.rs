// Vigil Network Layer — Address Manager
// Copyright (c) 2025-2026 The Vigil Project Developers
// Distributed under the MIT software license.

//! Bucketed address manager for peer discovery.
//!
//! Candidate peer addresses live in two tables:
//!
//! - **new** — heard about, never connected. Untrusted gossip.
//! - **tried** — successfully connected at least once. The trust anchor
//!   for outbound selection.
//!
//! Both tables are fixed arrays of fixed-capacity buckets. Placement is a
//! keyed hash of (source netgroup, address netgroup) for "new" and
//! (address netgroup, address) for "tried"; the slot within a bucket hashes
//! the address alone. The key is a per-node random secret persisted with
//! the tables, so:
//!
//! - the same address always lands in the same slot (collisions are
//!   intentional, not random),
//! - an attacker cannot predict or target another node's buckets,
//! - attacker addresses from one netgroup only contest their own
//!   deterministic bucket — flooding cannot touch the rest of the table.
//!
//! Eviction is collision-based, not LRU: O(1) insert/evict, and a worse
//! occupant never silently displaces a better one. Terminally stale
//! occupants (no successful connection within 30 days) are purged lazily
//! when their slot is contested, never by proactive scan.
//!
//! # Memory Bounds
//!
//! | Table | Buckets | Slots | Max entries |
//! |-------|---------|-------|-------------|
//! | new   | 256     | 64    | 16,384      |
//! | tried | 64      | 64    | 4,096       |
//!
//! # Durable Format
//!
//! `save`/`load` round-trip the sip key and both tables through bincode.
//! Losing this file resets discovery to seeds, so it is written on every
//! maintenance pass and on shutdown (compatibility-sensitive).

use crate::net::types::{AddressInfo, NetAddress};
use crate::types::NetgroupKey;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::hash::Hasher;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Buckets in the "new" table.
pub const NEW_BUCKET_COUNT: usize = 256;

/// Buckets in the "tried" table.
pub const TRIED_BUCKET_COUNT: usize = 64;

/// Slots per bucket, both tables.
pub const BUCKET_SIZE: usize = 64;

/// Probe attempts before `select` falls back to a scan.
const MAX_SELECT_PROBES: usize = 256;

/// Default bias toward the tried table during selection.
pub const DEFAULT_TRIED_BIAS: f64 = 0.5;

#[derive(Error, Debug)]
pub enum AddrManError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    info: AddressInfo,
    in_tried: bool,
}

/// Aggregate counters for operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddrManStats {
    pub new: usize,
    pub tried: usize,
    pub connected: usize,
    pub collisions_dropped: u64,
    pub stale_purged: u64,
}

/// On-disk representation: entries plus the placement key. Buckets are
/// rebuilt from scratch on load since placement is deterministic.
#[derive(Serialize, Deserialize)]
struct DiskState {
    key: (u64, u64),
    entries: Vec<Entry>,
}

pub struct AddrMan {
    key: (u64, u64),
    entries: HashMap<SocketAddr, Entry>,
    new_buckets: Vec<Vec<Option<SocketAddr>>>,
    tried_buckets: Vec<Vec<Option<SocketAddr>>>,
    connected: HashSet<SocketAddr>,
    collisions_dropped: u64,
    stale_purged: u64,
}

impl AddrMan {
    pub fn new() -> Self {
        Self::with_key(rand::random())
    }

    /// Deterministic placement key — tests and `load` only.
    pub fn with_key(key: (u64, u64)) -> Self {
        Self {
            key,
            entries: HashMap::new(),
            new_buckets: vec![vec![None; BUCKET_SIZE]; NEW_BUCKET_COUNT],
            tried_buckets: vec![vec![None; BUCKET_SIZE]; TRIED_BUCKET_COUNT],
            connected: HashSet::new(),
            collisions_dropped: 0,
            stale_purged: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn new_count(&self) -> usize {
        self.entries.values().filter(|e| !e.in_tried).count()
    }

    pub fn tried_count(&self) -> usize {
        self.entries.values().filter(|e| e.in_tried).count()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.entries.contains_key(addr)
    }

    pub fn is_tried(&self, addr: &SocketAddr) -> bool {
        self.entries.get(addr).map(|e| e.in_tried).unwrap_or(false)
    }

    pub fn stats(&self) -> AddrManStats {
        AddrManStats {
            new: self.new_count(),
            tried: self.tried_count(),
            connected: self.connected.len(),
            collisions_dropped: self.collisions_dropped,
            stale_purged: self.stale_purged,
        }
    }

    // =========================================================================
    // Insertion
    // =========================================================================

    /// Add a gossiped address to the "new" table.
    ///
    /// Returns true if the address entered the table. The deterministic
    /// slot may be contested: a terminally stale occupant is purged first;
    /// otherwise a better occupant (connected before, or seen more
    /// recently, or operator-seeded) wins and the incoming candidate is
    /// dropped.
    pub fn add(&mut self, addr: NetAddress, source: Option<SocketAddr>) -> bool {
        if !addr.is_routable() {
            debug!(addr = %addr.socket_addr(), "ignoring unroutable address");
            return false;
        }

        let sock = addr.socket_addr();
        if let Some(entry) = self.entries.get_mut(&sock) {
            // Known address: freshen the timestamp, never move the slot
            if addr.timestamp > entry.info.addr.timestamp {
                entry.info.addr.timestamp = addr.timestamp;
            }
            return false;
        }

        let incoming = AddressInfo::new(addr, source);
        let bucket = self.new_bucket(&incoming.addr.netgroup(), source);
        let slot = self.slot_index(&sock);
        let now = crate::types::now();

        if let Some(occupant_addr) = self.new_buckets[bucket][slot] {
            let occupant = &self.entries[&occupant_addr];
            if occupant.info.is_terminally_stale(now) && !self.connected.contains(&occupant_addr) {
                self.purge(&occupant_addr);
            } else if Self::better(&self.entries[&occupant_addr].info, &incoming) {
                self.collisions_dropped += 1;
                debug!(
                    incoming = %sock,
                    occupant = %occupant_addr,
                    "new-table collision, incoming dropped"
                );
                return false;
            } else {
                // Occupant is worse: collision-based eviction
                self.purge(&occupant_addr);
            }
        }

        self.new_buckets[bucket][slot] = Some(sock);
        self.entries.insert(sock, Entry { info: incoming, in_tried: false });
        true
    }

    /// Add a batch of gossiped addresses, returning how many entered.
    pub fn add_many(&mut self, addrs: Vec<NetAddress>, source: SocketAddr) -> usize {
        addrs.into_iter().filter(|a| self.add(a.clone(), Some(source))).count()
    }

    /// Seed address from configuration: trusted source (None).
    pub fn add_seed(&mut self, addr: NetAddress) -> bool {
        self.add(addr, None)
    }

    // =========================================================================
    // Lifecycle marks
    // =========================================================================

    /// Record a successful handshake: promote the address into "tried" and
    /// mark it as currently connected.
    ///
    /// If the destination tried slot is occupied, the occupant is displaced
    /// back into its own new-table slot — never deleted — unless the
    /// occupant is itself currently connected, in which case the promotion
    /// is refused and the incoming address stays in "new" (a connected
    /// tried entry is protected; collision-engineering cannot displace it).
    pub fn mark_connected(&mut self, addr: &SocketAddr) {
        self.connected.insert(*addr);

        if !self.entries.contains_key(addr) {
            // Inbound peer we never heard about: enter it as new first
            let net = NetAddress::from_socket_addr(*addr);
            if !self.add(net, None) {
                return;
            }
        }

        {
            let Some(entry) = self.entries.get_mut(addr) else { return };
            entry.info.mark_success();
            if entry.in_tried {
                return;
            }
        }

        let tried_bucket = self.tried_bucket(addr);
        let slot = self.slot_index(addr);
        let now = crate::types::now();

        if let Some(occupant_addr) = self.tried_buckets[tried_bucket][slot] {
            if occupant_addr != *addr && self.connected.contains(&occupant_addr) {
                // Protected occupant: refuse the promotion, stay in "new"
                self.collisions_dropped += 1;
                debug!(
                    incoming = %addr,
                    occupant = %occupant_addr,
                    "tried slot held by connected peer, promotion refused"
                );
                return;
            }
        }

        // Leave the new table first, so a displaced occupant landing in our
        // new-table slot finds it free instead of purging us mid-promotion
        self.clear_new_slot(addr);

        if let Some(occupant_addr) = self.tried_buckets[tried_bucket][slot] {
            if occupant_addr != *addr {
                if self.entries[&occupant_addr].info.is_terminally_stale(now) {
                    self.purge(&occupant_addr);
                } else {
                    self.displace_to_new(occupant_addr);
                }
            }
        }

        self.tried_buckets[tried_bucket][slot] = Some(*addr);
        if let Some(entry) = self.entries.get_mut(addr) {
            entry.in_tried = true;
        }
    }

    /// Record a connection attempt (outbound dial started).
    pub fn mark_attempt(&mut self, addr: &SocketAddr) {
        if let Some(entry) = self.entries.get_mut(addr) {
            entry.info.mark_attempt();
        }
    }

    /// Record a failed or evicted connection. Not a ban: the entry stays,
    /// deprioritized by the terrible-address heuristic.
    pub fn mark_failed(&mut self, addr: &SocketAddr) {
        if let Some(entry) = self.entries.get_mut(addr) {
            entry.info.mark_attempt();
        }
        self.connected.remove(addr);
    }

    /// Record a clean disconnect.
    pub fn mark_disconnected(&mut self, addr: &SocketAddr) {
        self.connected.remove(addr);
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Pick an outbound candidate. `bias` is the probability of drawing
    /// from the tried table when both tables are populated.
    pub fn select(&self, bias: f64) -> Option<NetAddress> {
        self.select_with_rng(&mut rand::thread_rng(), bias)
    }

    /// [`select`](Self::select) with a caller-supplied RNG (deterministic
    /// tests).
    pub fn select_with_rng<R: Rng>(&self, rng: &mut R, bias: f64) -> Option<NetAddress> {
        let tried = self.tried_count();
        let fresh = self.new_count();
        if tried == 0 && fresh == 0 {
            return None;
        }

        let use_tried = if tried == 0 {
            false
        } else if fresh == 0 {
            true
        } else {
            rng.gen_range(0.0..1.0) < bias
        };

        let buckets = if use_tried { &self.tried_buckets } else { &self.new_buckets };
        let now = crate::types::now();

        for _ in 0..MAX_SELECT_PROBES {
            let b = rng.gen_range(0..buckets.len());
            let s = rng.gen_range(0..BUCKET_SIZE);
            let Some(sock) = buckets[b][s] else { continue };
            if self.connected.contains(&sock) {
                continue;
            }
            let info = &self.entries[&sock].info;
            if info.is_terrible(now) {
                continue;
            }
            if rng.gen_range(0.0..1.0) < info.select_chance(now) {
                return Some(info.addr.clone());
            }
        }

        // Sparse table: probing missed, scan for anything usable
        self.entries
            .values()
            .filter(|e| e.in_tried == use_tried)
            .filter(|e| !self.connected.contains(&e.info.addr.socket_addr()))
            .find(|e| !e.info.is_terrible(now))
            .map(|e| e.info.addr.clone())
    }

    /// Random sample of shareable addresses for a discovery reply.
    pub fn get_addr(&self, count: usize) -> Vec<NetAddress> {
        use rand::seq::SliceRandom;
        let now = crate::types::now();
        let mut rng = rand::thread_rng();
        let mut addrs: Vec<NetAddress> = self
            .entries
            .values()
            .filter(|e| !e.info.is_terrible(now))
            .map(|e| e.info.addr.clone())
            .collect();
        addrs.shuffle(&mut rng);
        addrs.truncate(count);
        addrs
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Sweep terminally stale, unconnected entries. Cheap: runs on the
    /// maintenance cadence, complementing the lazy purge on contention.
    pub fn expire(&mut self) -> usize {
        let now = crate::types::now();
        let stale: Vec<SocketAddr> = self
            .entries
            .iter()
            .filter(|(sock, e)| {
                !self.connected.contains(*sock) && e.info.is_terminally_stale(now)
            })
            .map(|(sock, _)| *sock)
            .collect();
        for sock in &stale {
            self.purge(sock);
        }
        stale.len()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write both tables and the placement key. Temp-file + rename so a
    /// crash mid-write cannot truncate the previous state.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), AddrManError> {
        let state = DiskState {
            key: self.key,
            entries: self.entries.values().cloned().collect(),
        };
        let bytes = bincode::serialize(&state)?;
        let tmp = path.as_ref().with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path.as_ref())?;
        Ok(())
    }

    /// Rebuild from disk. Bucket placement is re-derived from the persisted
    /// key, so every entry returns to the exact slot it occupied.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, AddrManError> {
        let bytes = std::fs::read(path)?;
        let state: DiskState = bincode::deserialize(&bytes)?;
        let mut addrman = Self::with_key(state.key);

        for entry in state.entries {
            let sock = entry.info.addr.socket_addr();
            if entry.in_tried {
                let bucket = addrman.tried_bucket(&sock);
                let slot = addrman.slot_index(&sock);
                if addrman.tried_buckets[bucket][slot].is_none() {
                    addrman.tried_buckets[bucket][slot] = Some(sock);
                    addrman.entries.insert(sock, entry);
                } else {
                    warn!(addr = %sock, "tried slot conflict on load, dropping entry");
                }
            } else {
                let bucket = addrman.new_bucket(&entry.info.addr.netgroup(), entry.info.source);
                let slot = addrman.slot_index(&sock);
                if addrman.new_buckets[bucket][slot].is_none() {
                    addrman.new_buckets[bucket][slot] = Some(sock);
                    addrman.entries.insert(sock, entry);
                } else {
                    warn!(addr = %sock, "new slot conflict on load, dropping entry");
                }
            }
        }
        Ok(addrman)
    }

    // =========================================================================
    // Placement
    // =========================================================================

    fn sip(&self, domain: u8, parts: &[&[u8]]) -> u64 {
        let mut hasher = siphasher::sip::SipHasher13::new_with_keys(self.key.0, self.key.1);
        hasher.write_u8(domain);
        for part in parts {
            hasher.write(part);
        }
        hasher.finish()
    }

    fn netgroup_bytes(group: NetgroupKey) -> [u8; 5] {
        match group {
            NetgroupKey::V4(g) => {
                let b = g.to_be_bytes();
                [4, b[0], b[1], 0, 0]
            }
            NetgroupKey::V6(g) => {
                let b = g.to_be_bytes();
                [6, b[0], b[1], b[2], b[3]]
            }
        }
    }

    fn addr_bytes(sock: &SocketAddr) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(18);
        match sock.ip() {
            std::net::IpAddr::V4(ip) => bytes.extend_from_slice(&ip.octets()),
            std::net::IpAddr::V6(ip) => bytes.extend_from_slice(&ip.octets()),
        }
        bytes.extend_from_slice(&sock.port().to_be_bytes());
        bytes
    }

    /// New-table bucket: keyed hash of (source netgroup, address netgroup).
    /// One gossip source can only seed a handful of buckets.
    fn new_bucket(&self, addr_group: &NetgroupKey, source: Option<SocketAddr>) -> usize {
        let source_group = source
            .map(|s| Self::netgroup_bytes(crate::types::ip_to_netgroup(s.ip())))
            .unwrap_or([0u8; 5]);
        let addr_group = Self::netgroup_bytes(*addr_group);
        (self.sip(b'n', &[&source_group, &addr_group]) % NEW_BUCKET_COUNT as u64) as usize
    }

    /// Tried-table bucket: keyed hash of (address netgroup, address).
    fn tried_bucket(&self, sock: &SocketAddr) -> usize {
        let group = Self::netgroup_bytes(crate::types::ip_to_netgroup(sock.ip()));
        let addr = Self::addr_bytes(sock);
        (self.sip(b't', &[&group, &addr]) % TRIED_BUCKET_COUNT as u64) as usize
    }

    /// Slot within a bucket: keyed hash of the address alone.
    fn slot_index(&self, sock: &SocketAddr) -> usize {
        let addr = Self::addr_bytes(sock);
        (self.sip(b's', &[&addr]) % BUCKET_SIZE as u64) as usize
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// "Better" ordering for slot contention: proven reachability first,
    /// then operator seeding, then freshness.
    fn better(occupant: &AddressInfo, incoming: &AddressInfo) -> bool {
        if (occupant.last_success > 0) != (incoming.last_success > 0) {
            return occupant.last_success > 0;
        }
        if occupant.source.is_none() != incoming.source.is_none() {
            return occupant.source.is_none();
        }
        occupant.addr.timestamp >= incoming.addr.timestamp
    }

    /// Displace a tried entry back into its new-table slot (never deleted).
    /// A worse occupant of that new slot is evicted; a better one means the
    /// displaced entry still takes the slot — it has connection history.
    fn displace_to_new(&mut self, sock: SocketAddr) {
        let Some(mut entry) = self.entries.remove(&sock) else { return };
        self.clear_tried_slot(&sock);
        entry.in_tried = false;

        let bucket = self.new_bucket(&entry.info.addr.netgroup(), entry.info.source);
        let slot = self.slot_index(&sock);

        if let Some(existing) = self.new_buckets[bucket][slot] {
            if existing != sock {
                // Tried history outranks anything sitting in "new"
                self.purge(&existing);
            }
        }
        self.new_buckets[bucket][slot] = Some(sock);
        self.entries.insert(sock, entry);
        debug!(addr = %sock, "tried entry displaced back to new table");
    }

    fn clear_new_slot(&mut self, sock: &SocketAddr) {
        if let Some(entry) = self.entries.get(sock) {
            let bucket = self.new_bucket(&entry.info.addr.netgroup(), entry.info.source);
            let slot = self.slot_index(sock);
            if self.new_buckets[bucket][slot] == Some(*sock) {
                self.new_buckets[bucket][slot] = None;
            }
        }
    }

    fn clear_tried_slot(&mut self, sock: &SocketAddr) {
        let bucket = self.tried_bucket(sock);
        let slot = self.slot_index(sock);
        if self.tried_buckets[bucket][slot] == Some(*sock) {
            self.tried_buckets[bucket][slot] = None;
        }
    }

    fn purge(&mut self, sock: &SocketAddr) {
        let in_tried = match self.entries.get(sock) {
            Some(entry) => entry.in_tried,
            None => return,
        };
        if in_tried {
            self.clear_tried_slot(sock);
        } else {
            self.clear_new_slot(sock);
        }
        self.entries.remove(sock);
        self.stale_purged += 1;
    }
}

impl Default for AddrMan {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;
    use std::net::IpAddr;

    fn net(a: u8, b: u8, c: u8, d: u8, port: u16) -> NetAddress {
        NetAddress::new(IpAddr::V4(std::net::Ipv4Addr::new(a, b, c, d)), port)
    }

    fn source(a: u8) -> SocketAddr {
        format!("{a}.50.1.1:19400").parse().unwrap()
    }

    fn addrman() -> AddrMan {
        AddrMan::with_key((0x1234_5678, 0x9abc_def0))
    }

    #[test]
    fn test_add_and_duplicate() {
        let mut am = addrman();
        let addr = net(8, 8, 8, 8, 19400);

        assert!(am.add(addr.clone(), Some(source(1))));
        assert!(!am.add(addr.clone(), Some(source(1))));
        assert_eq!(am.len(), 1);
        assert_eq!(am.new_count(), 1);
        assert_eq!(am.tried_count(), 0);
    }

    #[test]
    fn test_unroutable_rejected() {
        let mut am = addrman();
        assert!(!am.add(net(127, 0, 0, 1, 19400), None));
        assert!(!am.add(net(10, 1, 2, 3, 19400), None));
        assert!(!am.add(net(192, 168, 0, 1, 19400), None));
        assert!(am.is_empty());
    }

    #[test]
    fn test_mark_connected_promotes_to_tried() {
        let mut am = addrman();
        let addr = net(8, 8, 8, 8, 19400);
        am.add(addr.clone(), Some(source(1)));

        am.mark_connected(&addr.socket_addr());
        assert_eq!(am.new_count(), 0);
        assert_eq!(am.tried_count(), 1);
        assert!(am.is_tried(&addr.socket_addr()));
    }

    #[test]
    fn test_never_in_both_tables() {
        // Exercise arbitrary add/mark_connected interleavings, then check
        // the exclusivity invariant against the actual bucket arrays.
        let mut am = addrman();
        let mut rng = ChaCha20Rng::seed_from_u64(7);

        for i in 0..500u32 {
            let a = (i % 200) as u8;
            let addr = net(1 + a, 2, (i / 256) as u8, (i % 256) as u8, 19400);
            am.add(addr.clone(), Some(source((i % 5) as u8 + 1)));
            if rng.gen_bool(0.5) {
                am.mark_connected(&addr.socket_addr());
            }
            if rng.gen_bool(0.3) {
                am.mark_disconnected(&addr.socket_addr());
            }
        }

        let in_new: HashSet<SocketAddr> = am
            .new_buckets
            .iter()
            .flatten()
            .filter_map(|s| *s)
            .collect();
        let in_tried: HashSet<SocketAddr> = am
            .tried_buckets
            .iter()
            .flatten()
            .filter_map(|s| *s)
            .collect();
        assert!(in_new.is_disjoint(&in_tried), "address present in both tables");

        // Flags agree with the arrays
        for (sock, entry) in &am.entries {
            if entry.in_tried {
                assert!(in_tried.contains(sock));
            } else {
                assert!(in_new.contains(sock));
            }
        }
    }

    #[test]
    fn test_deterministic_placement() {
        let am1 = addrman();
        let am2 = addrman();
        let sock: SocketAddr = "8.8.8.8:19400".parse().unwrap();

        assert_eq!(am1.slot_index(&sock), am2.slot_index(&sock));
        assert_eq!(am1.tried_bucket(&sock), am2.tried_bucket(&sock));

        // Different key, different placement (with overwhelming probability
        // across many addresses)
        let other = AddrMan::with_key((1, 2));
        let mut differs = false;
        for i in 0..64u8 {
            let s: SocketAddr = format!("8.8.8.{i}:19400").parse().unwrap();
            if am1.slot_index(&s) != other.slot_index(&s) {
                differs = true;
                break;
            }
        }
        assert!(differs);
    }

    #[test]
    fn test_readd_does_not_move_slot() {
        let mut am = addrman();
        let addr = net(8, 8, 8, 8, 19400);
        am.add(addr.clone(), Some(source(1)));

        let bucket = am.new_bucket(&addr.netgroup(), Some(source(1)));
        let slot = am.slot_index(&addr.socket_addr());
        assert_eq!(am.new_buckets[bucket][slot], Some(addr.socket_addr()));

        // Re-adding with the same source is a timestamp refresh, not a move
        am.add(addr.clone(), Some(source(1)));
        assert_eq!(am.new_buckets[bucket][slot], Some(addr.socket_addr()));
        assert_eq!(am.len(), 1);
    }

    #[test]
    fn test_collision_keeps_better_candidate() {
        let mut am = addrman();

        // Find two addresses colliding in the new table under source(1)
        let src = source(1);
        let mut colliding: Option<(NetAddress, NetAddress)> = None;
        'outer: for i in 0..=255u8 {
            for j in (i as u16 + 1)..=255 {
                let a = net(8, 8, 0, i, 19400);
                let b = net(8, 8, 1, j as u8, 19400);
                let same_bucket =
                    am.new_bucket(&a.netgroup(), Some(src)) == am.new_bucket(&b.netgroup(), Some(src));
                let same_slot =
                    am.slot_index(&a.socket_addr()) == am.slot_index(&b.socket_addr());
                if same_bucket && same_slot {
                    colliding = Some((a, b));
                    break 'outer;
                }
            }
        }
        let (a, b) = colliding.expect("collision must exist within one netgroup");

        let mut fresh_a = a.clone();
        fresh_a.timestamp = crate::types::now(); // recently seen
        let mut old_b = b.clone();
        old_b.timestamp = crate::types::now() - 1000; // older than occupant

        assert!(am.add(fresh_a.clone(), Some(src)));
        assert!(!am.add(old_b, Some(src)), "older candidate must not evict fresher occupant");
        assert!(am.contains(&fresh_a.socket_addr()));
        assert_eq!(am.stats().collisions_dropped, 1);
    }

    #[test]
    fn test_tried_collision_displaces_to_new_not_deleted() {
        let mut am = addrman();

        // Two addresses sharing a tried bucket+slot
        let mut pair: Option<(NetAddress, NetAddress)> = None;
        'outer: for i in 0..=255u8 {
            for j in 0..=255u8 {
                if i == j {
                    continue;
                }
                let a = net(20, 1, 0, i, 19400);
                let b = net(30, 2, 0, j, 19400);
                if am.tried_bucket(&a.socket_addr()) == am.tried_bucket(&b.socket_addr())
                    && am.slot_index(&a.socket_addr()) == am.slot_index(&b.socket_addr())
                {
                    pair = Some((a, b));
                    break 'outer;
                }
            }
        }
        let (a, b) = pair.expect("tried collision must exist (64×64 slots, 65k candidates)");

        am.add(a.clone(), Some(source(1)));
        am.mark_connected(&a.socket_addr());
        am.mark_disconnected(&a.socket_addr());
        assert!(am.is_tried(&a.socket_addr()));

        // b connects: a is displaced back into "new", never deleted
        am.add(b.clone(), Some(source(2)));
        am.mark_connected(&b.socket_addr());

        assert!(am.is_tried(&b.socket_addr()));
        assert!(am.contains(&a.socket_addr()), "displaced entry must survive");
        assert!(!am.is_tried(&a.socket_addr()));
        assert_eq!(am.tried_count(), 1);
    }

    #[test]
    fn test_connected_tried_occupant_protected() {
        let mut am = addrman();

        let mut pair: Option<(NetAddress, NetAddress)> = None;
        'outer: for i in 0..=255u8 {
            for j in 0..=255u8 {
                if i == j {
                    continue;
                }
                let a = net(20, 1, 0, i, 19400);
                let b = net(30, 2, 0, j, 19400);
                if am.tried_bucket(&a.socket_addr()) == am.tried_bucket(&b.socket_addr())
                    && am.slot_index(&a.socket_addr()) == am.slot_index(&b.socket_addr())
                {
                    pair = Some((a, b));
                    break 'outer;
                }
            }
        }
        let (a, b) = pair.expect("tried collision must exist");

        // a is tried AND currently connected
        am.add(a.clone(), Some(source(1)));
        am.mark_connected(&a.socket_addr());

        // b's promotion collides with the protected occupant: refused
        am.add(b.clone(), Some(source(2)));
        am.mark_connected(&b.socket_addr());

        assert!(am.is_tried(&a.socket_addr()), "connected occupant must keep its slot");
        assert!(!am.is_tried(&b.socket_addr()), "promotion into protected slot must be refused");
        assert!(am.contains(&b.socket_addr()), "refused candidate stays in new");
    }

    #[test]
    fn test_select_bias_toward_tried() {
        let mut am = addrman();

        // Populate both tables
        for i in 0..30u8 {
            let addr = net(40 + (i % 10), i, 1, i, 19400);
            am.add(addr.clone(), Some(source(1)));
            if i < 15 {
                am.mark_connected(&addr.socket_addr());
                am.mark_disconnected(&addr.socket_addr());
            }
        }
        assert!(am.tried_count() > 0 && am.new_count() > 0);

        let mut rng = ChaCha20Rng::seed_from_u64(99);
        let mut tried_hits = 0;
        let total = 400;
        for _ in 0..total {
            let picked = am.select_with_rng(&mut rng, 0.9).expect("tables populated");
            if am.is_tried(&picked.socket_addr()) {
                tried_hits += 1;
            }
        }
        // 90% bias: overwhelmingly tried picks
        assert!(tried_hits > total * 3 / 4, "only {tried_hits}/{total} from tried");
    }

    #[test]
    fn test_select_skips_connected_and_terrible() {
        let mut am = addrman();
        let only = net(50, 1, 1, 1, 19400);
        am.add(only.clone(), Some(source(1)));
        am.mark_connected(&only.socket_addr());

        // The single known address is connected: nothing to select
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        assert!(am.select_with_rng(&mut rng, 0.5).is_none());

        am.mark_disconnected(&only.socket_addr());
        assert!(am.select_with_rng(&mut rng, 0.5).is_some());
    }

    #[test]
    fn test_stale_purged_on_contention() {
        let mut am = addrman();

        // Same collision-pair trick, occupant made terminally stale
        let src = source(1);
        let mut pair: Option<(NetAddress, NetAddress)> = None;
        'outer: for i in 0..=255u8 {
            for j in 0..=255u8 {
                if i == j {
                    continue;
                }
                let a = net(8, 8, 0, i, 19400);
                let b = net(8, 8, 1, j, 19400);
                if am.new_bucket(&a.netgroup(), Some(src)) == am.new_bucket(&b.netgroup(), Some(src))
                    && am.slot_index(&a.socket_addr()) == am.slot_index(&b.socket_addr())
                {
                    pair = Some((a, b));
                    break 'outer;
                }
            }
        }
        let (mut a, b) = pair.expect("collision must exist");

        a.timestamp = crate::types::now() - (31 * 24 * 60 * 60); // beyond 30 days
        am.add(a.clone(), Some(src));
        assert_eq!(am.len(), 1);

        // Contending candidate purges the stale occupant and takes the slot
        assert!(am.add(b.clone(), Some(src)));
        assert!(!am.contains(&a.socket_addr()));
        assert!(am.contains(&b.socket_addr()));
        assert_eq!(am.stats().stale_purged, 1);
    }

    #[test]
    fn test_expire_sweeps_stale() {
        let mut am = addrman();
        let mut stale = net(60, 1, 1, 1, 19400);
        stale.timestamp = crate::types::now() - (31 * 24 * 60 * 60);
        let fresh = net(61, 1, 1, 1, 19400);

        am.add(stale.clone(), Some(source(1)));
        am.add(fresh.clone(), Some(source(1)));
        assert_eq!(am.expire(), 1);
        assert!(!am.contains(&stale.socket_addr()));
        assert!(am.contains(&fresh.socket_addr()));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peers.dat");

        let mut am = addrman();
        for i in 0..20u8 {
            let addr = net(70 + (i % 5), i, 1, i, 19400);
            am.add(addr.clone(), Some(source(1)));
            if i % 3 == 0 {
                am.mark_connected(&addr.socket_addr());
                am.mark_disconnected(&addr.socket_addr());
            }
        }
        am.save(&path).unwrap();

        let loaded = AddrMan::load(&path).unwrap();
        assert_eq!(loaded.len(), am.len());
        assert_eq!(loaded.new_count(), am.new_count());
        assert_eq!(loaded.tried_count(), am.tried_count());

        // Placement identical after reload (same persisted key)
        for sock in am.entries.keys() {
            assert_eq!(loaded.is_tried(sock), am.is_tried(sock));
            assert_eq!(loaded.slot_index(sock), am.slot_index(sock));
        }
    }

    #[test]
    fn test_get_addr_excludes_terrible() {
        let mut am = addrman();
        let mut bad = net(80, 1, 1, 1, 19400);
        bad.timestamp = crate::types::now() + 3600; // future timestamp
        am.add(net(81, 1, 1, 1, 19400), Some(source(1)));
        am.add(bad.clone(), Some(source(1)));

        let shared = am.get_addr(10);
        assert!(shared.iter().all(|a| a.socket_addr() != bad.socket_addr()));
    }
}
