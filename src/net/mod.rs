//! Peer defense layer: address tables, connection set, rate limiting.

pub mod addrman;
pub mod connection;
pub mod eviction;
pub mod peer;
pub mod rate_limit;
pub mod service;
pub mod types;

// Re-exports
pub use addrman::{AddrMan, AddrManError, AddrManStats, DEFAULT_TRIED_BIAS};
pub use connection::{
    AdmissionError, ConnConfig, ConnConfigError, ConnId, ConnMeta, ConnectionManager,
    ConnectionStats, DiscouragedFilter,
};
pub use eviction::{eviction_stats, select_peer_to_evict, EvictionStats};
pub use peer::{Peer, PeerInfo, MISBEHAVIOR_THRESHOLD};
pub use rate_limit::{
    FlowControl, MessageClass, PeerRateLimits, RateLimitConfig, RateLimitStats, TokenBucket,
    Verdict, MAX_RECV_QUEUE_BYTES,
};
pub use service::{
    InboundDecision, MaintenanceEvent, MessageGate, NetConfig, NetConfigError, NetService,
    NetStats,
};
pub use types::{
    AddressInfo, NetAddress, MAX_CONNECTIONS_PER_IP, MAX_INBOUND, MAX_OUTBOUND, MAX_PEERS,
    MAX_PEERS_PER_NETGROUP,
};
