// Vigil Network Layer — Per-Peer Rate Limiting
// Copyright (c) 2025-2026 The Vigil Project Developers
// Distributed under the MIT software license.

//! Token-bucket rate limiting, charged per peer and per message class.
//!
//! Every inbound message is charged against one of the class buckets below.
//! A class with no explicit limit charges the catch-all bucket — there is no
//! uncharged path, so no message type reachable by an unauthenticated peer
//! is unbounded.
//!
//! Refill is computed lazily from elapsed time on access. There is no
//! ticking task, so a thousand idle peers cost nothing, and per-peer state
//! is owned by the peer's own connection task — concurrent peers never
//! contend on a shared lock.
//!
//! Escalation: sustained throttling hardens into `Reject`, which the caller
//! translates into discouragement (a decaying soft ban, see connection.rs).
//! This layer alone never bans permanently.
//!
//! Memory: [`FlowControl`] caps the bytes a peer may have buffered but
//! unprocessed, independent of message count — many small messages cannot
//! substitute for one large one.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Cap on buffered-but-unprocessed bytes per peer (2 MB).
pub const MAX_RECV_QUEUE_BYTES: usize = 2 * 1024 * 1024;

/// Consecutive throttles (within the strike horizon) before escalation.
pub const REJECT_AFTER_THROTTLES: u32 = 10;

/// Throttle strikes are forgotten after this long without one.
pub const STRIKE_HORIZON: Duration = Duration::from_secs(60);

// =============================================================================
// MESSAGE CLASSES
// =============================================================================

/// Coarse message classes the transport tags frames with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageClass {
    /// Address gossip and peer discovery.
    Discovery,
    /// Inventory announcements.
    Inventory,
    /// Data requests (get-entry, get-range).
    DataRequest,
    /// Bulk payloads (ledger entries, presence batches).
    Bulk,
    /// Control traffic (ping/pong, version negotiation).
    Control,
    /// Anything unclassified. Still charged — never a bypass.
    Other,
}

impl MessageClass {
    pub const ALL: [MessageClass; 6] = [
        MessageClass::Discovery,
        MessageClass::Inventory,
        MessageClass::DataRequest,
        MessageClass::Bulk,
        MessageClass::Control,
        MessageClass::Other,
    ];

    fn slot(&self) -> usize {
        match self {
            MessageClass::Discovery => 0,
            MessageClass::Inventory => 1,
            MessageClass::DataRequest => 2,
            MessageClass::Bulk => 3,
            MessageClass::Control => 4,
            MessageClass::Other => 5,
        }
    }
}

/// Admission verdict for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Charge accepted, process the message.
    Allow,
    /// Bucket empty: pause reads from this peer (backpressure), drop the
    /// message, do not escalate yet.
    Throttle,
    /// Sustained abuse: drop and discourage the peer.
    Reject,
}

// =============================================================================
// TOKEN BUCKET
// =============================================================================

/// Classic token bucket with lazy refill.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self { capacity, tokens: capacity, refill_per_sec, last_refill: Instant::now() }
    }

    /// Consume `cost` tokens, refilling from elapsed time first.
    pub fn try_consume(&mut self, cost: f64) -> bool {
        self.try_consume_at(cost, Instant::now())
    }

    /// Like [`try_consume`](Self::try_consume) with an explicit clock, so
    /// tests control time.
    pub fn try_consume_at(&mut self, cost: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }

    /// Consume up to `wanted` whole tokens, returning how many were granted.
    /// Used for batch messages (e.g. an address gossip of 1000 entries).
    pub fn consume_up_to(&mut self, wanted: usize, now: Instant) -> usize {
        self.refill(now);
        let granted = (self.tokens.floor() as usize).min(wanted);
        self.tokens -= granted as f64;
        granted
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
    }
}

// =============================================================================
// CONFIG
// =============================================================================

/// Per-class bucket sizing: (burst capacity, refill per second).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub discovery: (f64, f64),
    pub inventory: (f64, f64),
    pub data_request: (f64, f64),
    pub bulk: (f64, f64),
    pub control: (f64, f64),
    pub other: (f64, f64),
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            // Address gossip is cheap to fake and poisonous in bulk:
            // generous initial burst for the first exchange, then a trickle.
            discovery: (1000.0, 0.1),
            inventory: (1000.0, 50.0),
            data_request: (500.0, 50.0),
            bulk: (100.0, 100.0),
            control: (8.0, 1.0),
            other: (50.0, 5.0),
        }
    }
}

impl RateLimitConfig {
    fn params(&self, class: MessageClass) -> (f64, f64) {
        match class {
            MessageClass::Discovery => self.discovery,
            MessageClass::Inventory => self.inventory,
            MessageClass::DataRequest => self.data_request,
            MessageClass::Bulk => self.bulk,
            MessageClass::Control => self.control,
            MessageClass::Other => self.other,
        }
    }
}

// =============================================================================
// PER-PEER LIMITS
// =============================================================================

/// Aggregate counters for one peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitStats {
    pub allowed: u64,
    pub throttled: u64,
    pub rejected: u64,
}

/// Per-peer, per-class token buckets. Owned by the peer's connection task —
/// never shared across peers.
#[derive(Debug)]
pub struct PeerRateLimits {
    buckets: [TokenBucket; 6],
    throttle_strikes: u32,
    last_strike: Option<Instant>,
    stats: RateLimitStats,
}

impl PeerRateLimits {
    pub fn new(config: &RateLimitConfig) -> Self {
        let mk = |class: MessageClass| {
            let (capacity, refill) = config.params(class);
            TokenBucket::new(capacity, refill)
        };
        Self {
            buckets: [
                mk(MessageClass::Discovery),
                mk(MessageClass::Inventory),
                mk(MessageClass::DataRequest),
                mk(MessageClass::Bulk),
                mk(MessageClass::Control),
                mk(MessageClass::Other),
            ],
            throttle_strikes: 0,
            last_strike: None,
            stats: RateLimitStats::default(),
        }
    }

    /// Charge one message of `class` costing `cost` units (usually 1, or
    /// the item count for batch messages).
    pub fn admit(&mut self, class: MessageClass, cost: f64) -> Verdict {
        self.admit_at(class, cost, Instant::now())
    }

    /// [`admit`](Self::admit) with an explicit clock for tests.
    pub fn admit_at(&mut self, class: MessageClass, cost: f64, now: Instant) -> Verdict {
        if self.buckets[class.slot()].try_consume_at(cost, now) {
            self.stats.allowed += 1;
            return Verdict::Allow;
        }

        // Forget stale strikes before counting this one
        if let Some(last) = self.last_strike {
            if now.saturating_duration_since(last) > STRIKE_HORIZON {
                self.throttle_strikes = 0;
            }
        }
        self.throttle_strikes += 1;
        self.last_strike = Some(now);

        if self.throttle_strikes > REJECT_AFTER_THROTTLES {
            self.stats.rejected += 1;
            Verdict::Reject
        } else {
            self.stats.throttled += 1;
            Verdict::Throttle
        }
    }

    /// Grant up to `wanted` items from a batch message (discovery gossip).
    pub fn admit_batch(&mut self, class: MessageClass, wanted: usize) -> usize {
        self.buckets[class.slot()].consume_up_to(wanted, Instant::now())
    }

    pub fn stats(&self) -> RateLimitStats {
        self.stats
    }
}

// =============================================================================
// FLOW CONTROL
// =============================================================================

/// Byte-bounded receive accounting for one peer.
///
/// The connection task reserves a message's wire size before dispatch and
/// releases it after processing. While over budget the task must pause
/// reads — backpressure propagates to the remote's send side through the
/// transport instead of queueing locally without bound.
#[derive(Debug, Clone)]
pub struct FlowControl {
    pub recv_queue_bytes: usize,
    max_bytes: usize,
}

impl FlowControl {
    pub fn new() -> Self {
        Self::with_limit(MAX_RECV_QUEUE_BYTES)
    }

    pub fn with_limit(max_bytes: usize) -> Self {
        Self { recv_queue_bytes: 0, max_bytes }
    }

    pub fn add_recv(&mut self, bytes: usize) {
        self.recv_queue_bytes = self.recv_queue_bytes.saturating_add(bytes);
    }

    pub fn remove_recv(&mut self, bytes: usize) {
        self.recv_queue_bytes = self.recv_queue_bytes.saturating_sub(bytes);
    }

    pub fn should_pause_recv(&self) -> bool {
        self.recv_queue_bytes >= self.max_bytes
    }
}

impl Default for FlowControl {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_burst_then_refill() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 1.0);

        for _ in 0..10 {
            assert!(bucket.try_consume_at(1.0, t0));
        }
        assert!(!bucket.try_consume_at(1.0, t0));

        // 5 seconds later: 5 tokens back
        let t5 = t0 + Duration::from_secs(5);
        for _ in 0..5 {
            assert!(bucket.try_consume_at(1.0, t5));
        }
        assert!(!bucket.try_consume_at(1.0, t5));
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(10.0, 100.0);
        let later = t0 + Duration::from_secs(3600);
        assert!((bucket.available(later) - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_consume_up_to_partial_grant() {
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(100.0, 0.1);
        assert_eq!(bucket.consume_up_to(1000, t0), 100);
        assert_eq!(bucket.consume_up_to(1000, t0), 0);
    }

    #[test]
    fn test_every_class_is_charged() {
        let config = RateLimitConfig::default();
        let t0 = Instant::now();
        for class in MessageClass::ALL {
            let mut limits = PeerRateLimits::new(&config);
            // Drain whatever the class allows; the verdict must eventually
            // stop being Allow for every class, including Other.
            let mut denied = false;
            for _ in 0..100_000 {
                if limits.admit_at(class, 1.0, t0) != Verdict::Allow {
                    denied = true;
                    break;
                }
            }
            assert!(denied, "class {class:?} is unbounded");
        }
    }

    #[test]
    fn test_bulk_flood_throttles_without_unbounded_buffering() {
        // 10,000 bulk messages inside one second against a 100/s bucket:
        // ~100 allowed (burst), the rest throttled or rejected.
        let config = RateLimitConfig::default();
        let mut limits = PeerRateLimits::new(&config);
        let mut flow = FlowControl::with_limit(64 * 1024);
        let t0 = Instant::now();

        let mut allowed = 0;
        let mut denied = 0;
        for i in 0..10_000u32 {
            let now = t0 + Duration::from_micros(i as u64 * 100); // 1s total
            match limits.admit_at(MessageClass::Bulk, 1.0, now) {
                Verdict::Allow => {
                    allowed += 1;
                    // Processed promptly: reserve and release
                    flow.add_recv(1024);
                    flow.remove_recv(1024);
                }
                Verdict::Throttle | Verdict::Reject => denied += 1,
            }
        }

        assert!(allowed <= 201, "allowed {allowed} from a 100/s bucket in ~1s");
        assert_eq!(allowed + denied, 10_000);
        assert_eq!(flow.recv_queue_bytes, 0);
    }

    #[test]
    fn test_sustained_throttling_escalates_to_reject() {
        let config = RateLimitConfig::default();
        let mut limits = PeerRateLimits::new(&config);
        let t0 = Instant::now();

        // Exhaust control bucket (capacity 8)
        for _ in 0..8 {
            assert_eq!(limits.admit_at(MessageClass::Control, 1.0, t0), Verdict::Allow);
        }

        let mut saw_reject = false;
        for _ in 0..=REJECT_AFTER_THROTTLES {
            if limits.admit_at(MessageClass::Control, 1.0, t0) == Verdict::Reject {
                saw_reject = true;
            }
        }
        assert!(saw_reject);
        assert!(limits.stats().rejected >= 1);
        assert_eq!(limits.stats().throttled as u32, REJECT_AFTER_THROTTLES);
    }

    #[test]
    fn test_strikes_decay_after_horizon() {
        let config = RateLimitConfig::default();
        let mut limits = PeerRateLimits::new(&config);
        let t0 = Instant::now();

        for _ in 0..8 {
            limits.admit_at(MessageClass::Control, 1.0, t0);
        }
        // Nine throttles, one short of escalation
        for _ in 0..9 {
            assert_eq!(limits.admit_at(MessageClass::Control, 1.0, t0), Verdict::Throttle);
        }

        // Quiet for longer than the strike horizon, then empty bucket again:
        // back to Throttle, not Reject
        let later = t0 + STRIKE_HORIZON + Duration::from_secs(120);
        // Drain refilled tokens first (control refills 1/s)
        while limits.admit_at(MessageClass::Control, 1.0, later) == Verdict::Allow {}
        assert_eq!(limits.admit_at(MessageClass::Control, 1.0, later), Verdict::Throttle);
    }

    #[test]
    fn test_flow_control_pause_threshold() {
        let mut flow = FlowControl::with_limit(1000);
        assert!(!flow.should_pause_recv());

        flow.add_recv(600);
        assert!(!flow.should_pause_recv());
        flow.add_recv(600);
        assert!(flow.should_pause_recv());

        flow.remove_recv(600);
        assert!(!flow.should_pause_recv());

        // Release below zero saturates
        flow.remove_recv(10_000);
        assert_eq!(flow.recv_queue_bytes, 0);
    }
}
