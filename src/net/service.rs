// Vigil Network Layer — Admission Pipeline
// Copyright (c) 2025-2026 The Vigil Project Developers
// Distributed under the MIT software license.

//! Glue between the listener, the connection tasks, and the defense state.
//!
//! ```text
//!                  ┌──────────────────┐
//!                  │    Listener      │
//!                  └────────┬─────────┘
//!                           │ accept_inbound()
//!                  ┌────────▼─────────┐
//!                  │    NetService    │ ◄── this module
//!                  └────────┬─────────┘
//!                           │
//!        ┌──────────────────┼───────────────────┐
//!        │                  │                   │
//! ┌──────▼──────┐    ┌──────▼───────┐    ┌──────▼───────┐
//! │   AddrMan   │    │ Connection   │    │  Eviction    │
//! │ (addresses) │    │   Manager    │    │   scorer     │
//! └─────────────┘    └──────────────┘    └──────────────┘
//! ```
//!
//! The admission order mirrors the trust model: discouragement first
//! (cheapest check, known abusers), then capacity with the eviction scorer,
//! then netgroup/per-IP diversity. Addresses only reach the tried table
//! after a completed handshake, so an attacker cannot poison it by merely
//! opening sockets.
//!
//! Locking discipline: AddrMan sits behind one async lock, the connection
//! set behind another. Critical sections are lookups and slot writes only —
//! no await under lock, no I/O under lock. Per-peer rate state lives inside
//! each connection task's `Peer`, unshared.
//!
//! Maintenance is one periodic low-priority task: expire + persist the
//! address tables, decay discouragement, and nudge the registry writer
//! about window rollover over an mpsc channel. It never blocks connection
//! tasks.

use crate::net::addrman::{AddrMan, AddrManStats, DEFAULT_TRIED_BIAS};
use crate::net::connection::{
    AdmissionError, ConnConfig, ConnConfigError, ConnId, ConnectionManager, ConnectionStats,
};
use crate::net::eviction::select_peer_to_evict;
use crate::net::peer::PeerInfo;
use crate::net::rate_limit::{MessageClass, RateLimitConfig, Verdict};
use crate::net::types::{
    DISCOURAGEMENT_INTEGRITY_STEP, DISCOURAGEMENT_RATE_LIMIT_STEP, MAINTENANCE_INTERVAL_SECS,
    NetAddress,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum NetConfigError {
    #[error("connection config invalid: {0}")]
    Conn(#[from] ConnConfigError),
    #[error("tried bias must be within [0, 1], got {0}")]
    BadBias(f64),
}

/// Network service configuration.
#[derive(Debug, Clone)]
pub struct NetConfig {
    pub data_dir: PathBuf,
    pub conn: ConnConfig,
    pub rate_limits: RateLimitConfig,
    /// Probability of drawing outbound targets from the tried table.
    pub tried_bias: f64,
    /// Operator-configured seed addresses.
    pub seeds: Vec<SocketAddr>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            conn: ConnConfig::default(),
            rate_limits: RateLimitConfig::default(),
            tried_bias: DEFAULT_TRIED_BIAS,
            seeds: vec![],
        }
    }
}

impl NetConfig {
    /// Fatal at startup, never relaxed at runtime.
    pub fn validate(&self) -> Result<(), NetConfigError> {
        self.conn.validate()?;
        if !(0.0..=1.0).contains(&self.tried_bias) {
            return Err(NetConfigError::BadBias(self.tried_bias));
        }
        Ok(())
    }
}

/// Outcome of an inbound admission check.
#[derive(Debug)]
pub enum InboundDecision {
    /// Slot granted.
    Accepted(ConnId),
    /// Slot granted after evicting this peer; the caller must close the
    /// evicted connection's socket.
    AcceptedWithEviction { id: ConnId, evicted: SocketAddr },
    /// No slot. Logged at debug; recovered locally (taxonomy class 1).
    Rejected(AdmissionError),
}

/// What the connection task should do with one gated message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageGate {
    /// Charge accepted: dispatch to the handler.
    Process,
    /// Bucket empty: drop the message and pause reads — backpressure
    /// flows to the remote's send side, never into local queues.
    Pause,
    /// Sustained abuse: drop the message; the address has been discouraged.
    /// The task should disconnect if discouragement crossed the threshold.
    Discouraged { disconnect: bool },
}

/// Signals from the maintenance task to the registry writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceEvent {
    /// Wall clock entered `window`; the registry should close up to it.
    WindowRollover(u64),
}

pub struct NetService {
    config: NetConfig,
    addrman: Arc<RwLock<AddrMan>>,
    connections: Arc<ConnectionManager>,
    shutdown: Arc<RwLock<bool>>,
}

impl NetService {
    /// Build the service, restoring the address tables from `peers.dat`
    /// when present.
    pub fn new(config: NetConfig) -> Result<Self, NetConfigError> {
        config.validate()?;

        let addr_path = config.data_dir.join("peers.dat");
        let mut addrman = if addr_path.exists() {
            AddrMan::load(&addr_path).unwrap_or_else(|e| {
                warn!("failed to load address tables: {e}, starting empty");
                AddrMan::new()
            })
        } else {
            AddrMan::new()
        };

        for seed in &config.seeds {
            addrman.add_seed(NetAddress::from_socket_addr(*seed));
        }
        info!(addresses = addrman.len(), "address tables ready");

        let connections = ConnectionManager::new(config.conn.clone())?;

        Ok(Self {
            config,
            addrman: Arc::new(RwLock::new(addrman)),
            connections: Arc::new(connections),
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn addrman(&self) -> &Arc<RwLock<AddrMan>> {
        &self.addrman
    }

    // =========================================================================
    // Admission
    // =========================================================================

    /// Admit an inbound connection.
    ///
    /// `peers` is the caller's live snapshot of open connections, used by
    /// the eviction scorer when inbound is full. A new peer is never
    /// silently dropped at capacity: the scorer runs first, and only if
    /// every candidate is protected is the connection rejected.
    pub async fn accept_inbound(
        &self,
        addr: SocketAddr,
        peers: &[PeerInfo],
    ) -> InboundDecision {
        if self.connections.is_discouraged(&addr).await {
            debug!(%addr, "rejecting discouraged inbound");
            return InboundDecision::Rejected(AdmissionError::Discouraged);
        }

        let mut evicted = None;
        if !self.connections.can_accept_inbound().await {
            match select_peer_to_evict(peers) {
                Some(victim) => {
                    self.connections.record_eviction(&victim).await;
                    // Eviction is a failed-connection mark, not a ban
                    self.addrman.write().await.mark_failed(&victim);
                    evicted = Some(victim);
                }
                None => {
                    debug!(%addr, "inbound full, all connections protected");
                    return InboundDecision::Rejected(AdmissionError::AtCapacity);
                }
            }
        }

        match self.connections.try_add(addr, true).await {
            Ok(id) => match evicted {
                Some(victim) => {
                    info!(%addr, evicted = %victim, "accepted inbound after eviction");
                    InboundDecision::AcceptedWithEviction { id, evicted: victim }
                }
                None => InboundDecision::Accepted(id),
            },
            Err(e) => InboundDecision::Rejected(e),
        }
    }

    /// Pick the next outbound dial target and mark the attempt.
    pub async fn select_outbound_target(&self) -> Option<NetAddress> {
        if !self.connections.need_outbound().await {
            return None;
        }
        let mut addrman = self.addrman.write().await;
        let candidate = addrman.select(self.config.tried_bias)?;
        let sock = candidate.socket_addr();
        drop(addrman);

        if self.connections.is_discouraged(&sock).await {
            return None;
        }
        self.addrman.write().await.mark_attempt(&sock);
        Some(candidate)
    }

    /// Register an established outbound connection (pre-handshake).
    pub async fn outbound_established(&self, addr: SocketAddr) -> Result<ConnId, AdmissionError> {
        self.connections.try_add(addr, false).await
    }

    /// Handshake completed: only now does the address enter the tried
    /// table (prevents tried-table poisoning by bare TCP dials).
    pub async fn handshake_complete(&self, addr: &SocketAddr) {
        self.addrman.write().await.mark_connected(addr);
    }

    /// Outbound dial or handshake failed.
    pub async fn connect_failed(&self, addr: &SocketAddr) {
        self.addrman.write().await.mark_failed(addr);
        self.connections.remove_by_addr(addr).await;
    }

    /// Release a connection. Synchronous: once this returns there are no
    /// ghost entries in the connection set or the address tables.
    pub async fn disconnect(&self, id: ConnId) {
        if let Some(meta) = self.connections.remove(id).await {
            self.addrman.write().await.mark_disconnected(&meta.addr);
        }
    }

    // =========================================================================
    // Message gating
    // =========================================================================

    /// Gate one framed message through the peer's rate limits.
    ///
    /// The caller owns the `Peer` (per-task state); this only translates
    /// verdicts into task actions and handles discouragement escalation.
    pub async fn gate_message(
        &self,
        peer: &mut crate::net::peer::Peer,
        class: MessageClass,
        cost: f64,
    ) -> MessageGate {
        match peer.rate_limits.admit(class, cost) {
            Verdict::Allow => MessageGate::Process,
            Verdict::Throttle => {
                debug!(addr = %peer.addr, ?class, "rate limited, pausing reads");
                MessageGate::Pause
            }
            Verdict::Reject => {
                self.connections
                    .discourage(&peer.addr, DISCOURAGEMENT_RATE_LIMIT_STEP)
                    .await;
                let disconnect = self.connections.is_discouraged(&peer.addr).await;
                MessageGate::Discouraged { disconnect }
            }
        }
    }

    /// Record an integrity error (malformed address, invalid proof).
    /// Returns true when the peer should be disconnected.
    pub async fn integrity_error(&self, addr: &SocketAddr, reason: &str) -> bool {
        debug!(%addr, reason, "integrity error");
        self.connections
            .discourage(addr, DISCOURAGEMENT_INTEGRITY_STEP)
            .await;
        self.connections.is_discouraged(addr).await
    }

    /// Ingest gossiped addresses that already passed the discovery-class
    /// rate limit.
    pub async fn add_gossiped(&self, addrs: Vec<NetAddress>, source: SocketAddr) -> usize {
        self.addrman.write().await.add_many(addrs, source)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Spawn the periodic maintenance task. Low priority by construction:
    /// short write sections for expiry, a read lock for the table save,
    /// and window rollover delegated to the registry writer over `events`.
    pub fn start_maintenance(&self, events: mpsc::Sender<MaintenanceEvent>) -> tokio::task::JoinHandle<()> {
        let addrman = self.addrman.clone();
        let connections = self.connections.clone();
        let shutdown = self.shutdown.clone();
        let addr_path = self.config.data_dir.join("peers.dat");

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(MAINTENANCE_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if *shutdown.read().await {
                    break;
                }

                let (expired, snapshot) = {
                    let mut am = addrman.write().await;
                    let expired = am.expire();
                    (expired, am.stats())
                };
                if expired > 0 {
                    debug!(expired, "expired stale addresses");
                }

                let save_result = { addrman.read().await.save(&addr_path) };
                if let Err(e) = save_result {
                    warn!("failed to save address tables: {e}");
                }

                connections.prune_discouragement().await;

                let window = crate::types::current_window();
                if events.send(MaintenanceEvent::WindowRollover(window)).await.is_err() {
                    // Registry writer gone: shutting down
                    break;
                }

                debug!(
                    new = snapshot.new,
                    tried = snapshot.tried,
                    "maintenance pass complete"
                );
            }
        })
    }

    /// Flag shutdown and persist the address tables one last time.
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        let addr_path = self.config.data_dir.join("peers.dat");
        if let Err(e) = self.addrman.read().await.save(&addr_path) {
            warn!("failed to save address tables on shutdown: {e}");
        }
    }

    pub async fn stats(&self) -> NetStats {
        NetStats {
            addrman: self.addrman.read().await.stats(),
            connections: self.connections.stats().await,
        }
    }
}

/// Operator-facing aggregate counters.
#[derive(Debug, Clone, Copy)]
pub struct NetStats {
    pub addrman: AddrManStats,
    pub connections: ConnectionStats,
}
