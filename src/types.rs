//! Shared types: the presence-window clock, netgroup keys, participant tiers.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const GENESIS_TIMESTAMP: u64 = 1735862400; // 2026-01-03 00:00:00 UTC

/// Presence window length (10 minutes). The whole cooldown and leader
/// machinery counts time in these units, never in raw seconds.
pub const WINDOW_MINUTES: u64 = 10;

/// Windows per day (144).
pub const WINDOWS_PER_DAY: u64 = 24 * 60 / WINDOW_MINUTES;

/// Adaptive cooldown constants, all in presence-window units.
pub const COOLDOWN_MIN_WINDOWS: u64 = WINDOWS_PER_DAY; // 1 day
pub const COOLDOWN_MID_WINDOWS: u64 = 7 * WINDOWS_PER_DAY; // 7 days
pub const COOLDOWN_MAX_WINDOWS: u64 = 180 * WINDOWS_PER_DAY; // 180 days
/// Median window: registrations over the trailing 14 days feed the median.
pub const COOLDOWN_WINDOW: u64 = 14 * WINDOWS_PER_DAY;
/// Smoothing: sliding average of the median over this many closed windows.
pub const COOLDOWN_SMOOTH_WINDOWS: u64 = 4;
/// Maximum applied-cooldown change per window (percent, either direction).
pub const COOLDOWN_MAX_CHANGE_PERCENT: u64 = 20;

/// Identity offline longer than this re-enters cooldown before regaining
/// eligibility (14 days of windows).
pub const REACTIVATION_HORIZON: u64 = 14 * WINDOWS_PER_DAY;

pub type Hash = [u8; 32];
pub type PublicKey = Vec<u8>; // opaque to this crate; sized by the crypto collaborator

// =============================================================================
// NETGROUP KEYS
// =============================================================================
//
// IPv4: /16 prefix (65,536 possible) — typical ISP assignment
// IPv6: /32 prefix — typical ISP allocation per RFC 6177
//
// A netgroup approximates "likely same owner/ISP". Connection diversity and
// eviction protection both key on it.

/// IPv4 /16 netgroup (first two octets).
pub type Netgroup16 = u16;

/// IPv6 /32 netgroup (first four octets).
pub type Netgroup32 = u32;

/// Unified netgroup key for dual-stack diversity limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetgroupKey {
    V4(Netgroup16),
    V6(Netgroup32),
}

/// Extract the netgroup key from an IP address.
pub fn ip_to_netgroup(ip: std::net::IpAddr) -> NetgroupKey {
    match ip {
        std::net::IpAddr::V4(ipv4) => {
            let octets = ipv4.octets();
            NetgroupKey::V4(((octets[0] as u16) << 8) | (octets[1] as u16))
        }
        std::net::IpAddr::V6(ipv6) => {
            let segments = ipv6.segments();
            // /32 = first two 16-bit segments
            NetgroupKey::V6(((segments[0] as u32) << 16) | (segments[1] as u32))
        }
    }
}

// =============================================================================
// PARTICIPANT TIERS
// =============================================================================

/// Participant tier in the leader lottery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Tier {
    /// Full Node — infrastructure, automatic presence, 80% of slots.
    FullNode,
    /// Verified User — FIDO2-gated human presence, 20% of slots.
    VerifiedUser,
}

impl Tier {
    /// Target slot share in percent.
    pub fn target_share(&self) -> u64 {
        match self {
            Tier::FullNode => 80,
            Tier::VerifiedUser => 20,
        }
    }

    pub fn index(&self) -> u8 {
        match self {
            Tier::FullNode => 0,
            Tier::VerifiedUser => 1,
        }
    }
}

/// Cooldown status for an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CooldownStatus {
    /// In cooldown: visible, signs presence, no lottery eligibility.
    Active { until_window: u64 },
    /// Cooldown complete.
    Completed,
}

impl CooldownStatus {
    pub fn is_active(&self, current_window: u64) -> bool {
        match self {
            CooldownStatus::Active { until_window } => current_window < *until_window,
            CooldownStatus::Completed => false,
        }
    }
}

// =============================================================================
// WINDOW CLOCK
// =============================================================================

pub fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Seconds since genesis.
pub fn secs_since_genesis() -> u64 {
    now().saturating_sub(GENESIS_TIMESTAMP)
}

/// Current presence-window index from genesis.
pub fn current_window() -> u64 {
    secs_since_genesis() / (WINDOW_MINUTES * 60)
}

/// Window index for an arbitrary unix timestamp.
pub fn window_at(timestamp: u64) -> u64 {
    timestamp.saturating_sub(GENESIS_TIMESTAMP) / (WINDOW_MINUTES * 60)
}

/// Seconds until the next window boundary.
pub fn secs_until_next_window() -> u64 {
    let period = WINDOW_MINUTES * 60;
    let elapsed = secs_since_genesis() % period;
    if elapsed == 0 { 0 } else { period - elapsed }
}

/// Format a window index for logging.
pub fn window_to_string(window: u64) -> String {
    let start_secs = GENESIS_TIMESTAMP + window * WINDOW_MINUTES * 60;
    let end_secs = start_secs + WINDOW_MINUTES * 60;

    use chrono::{TimeZone, Utc};
    let start = Utc.timestamp_opt(start_secs as i64, 0).single();
    let end = Utc.timestamp_opt(end_secs as i64, 0).single();

    match (start, end) {
        (Some(start), Some(end)) => format!(
            "window #{} ({} — {} UTC)",
            window,
            start.format("%Y-%m-%d %H:%M"),
            end.format("%H:%M")
        ),
        _ => format!("window #{}", window),
    }
}
