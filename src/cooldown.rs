//! Adaptive registration cooldown.
//!
//! New identities wait out a cooldown before gaining lottery eligibility.
//! The cooldown adapts to registration pressure: a flood of new identities
//! raises it toward 180 days, quiet periods let it fall back toward 1 day.
//! Attacking the network therefore costs real elapsed time, and the cost
//! rises with the size of the attack.
//!
//! ```text
//! ratio = current_count / smoothed_median
//!
//! ratio ≤ 1:  cooldown = MIN + ratio × (MID − MIN)
//! ratio > 1:  cooldown = MID + (ratio − 1) × (MAX − MID)
//!
//! clamped to [MIN, MAX], then rate-limited to ±20% per window
//! against the previous window's applied value.
//! ```
//!
//! # Attack Resistance
//!
//! - **Spike damping**: the median is smoothed over several closed windows,
//!   so one manufactured extreme window cannot swing the cooldown.
//! - **Swing damping**: the applied value moves at most 20% per window in
//!   either direction, so an attacker cannot crash the cooldown quickly by
//!   going quiet, nor spike it to lock out legitimate joiners.
//! - **No float in the curve**: all arithmetic is integer (u128 widening),
//!   so every node computes the identical cooldown.
//!
//! # Cold Start
//!
//! With fewer closed windows than the smoothing span there is no trustworthy
//! baseline. The engine falls back to MIN rather than failing registration.

use crate::types::{
    COOLDOWN_MAX_CHANGE_PERCENT, COOLDOWN_MAX_WINDOWS, COOLDOWN_MID_WINDOWS, COOLDOWN_MIN_WINDOWS,
    COOLDOWN_SMOOTH_WINDOWS, COOLDOWN_WINDOW,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CooldownConfigError {
    #[error("cooldown bounds inverted: min {min} > mid {mid} or mid {mid} > max {max}")]
    InvertedBounds { min: u64, mid: u64, max: u64 },
    #[error("smoothing span must be at least 1")]
    EmptySmoothing,
    #[error("median window must be at least 1")]
    EmptyMedianWindow,
    #[error("max change percent must be in 1..=100, got {0}")]
    BadChangePercent(u64),
}

/// Cooldown curve parameters, in presence-window units.
///
/// Defaults are the mainnet values (1 / 7 / 180 days of 10-minute windows).
/// Tests express the curve in day units by substituting their own bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownConfig {
    pub min: u64,
    pub mid: u64,
    pub max: u64,
    /// Trailing window count feeding the median.
    pub median_window: u64,
    /// Closed-window medians averaged into the smoothed median.
    pub smooth_windows: u64,
    /// Applied-value change limit per window, percent.
    pub max_change_percent: u64,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            min: COOLDOWN_MIN_WINDOWS,
            mid: COOLDOWN_MID_WINDOWS,
            max: COOLDOWN_MAX_WINDOWS,
            median_window: COOLDOWN_WINDOW,
            smooth_windows: COOLDOWN_SMOOTH_WINDOWS,
            max_change_percent: COOLDOWN_MAX_CHANGE_PERCENT,
        }
    }
}

impl CooldownConfig {
    /// Configuration violations are fatal at startup, never relaxed later.
    pub fn validate(&self) -> Result<(), CooldownConfigError> {
        if self.min > self.mid || self.mid > self.max {
            return Err(CooldownConfigError::InvertedBounds {
                min: self.min,
                mid: self.mid,
                max: self.max,
            });
        }
        if self.smooth_windows == 0 {
            return Err(CooldownConfigError::EmptySmoothing);
        }
        if self.median_window == 0 {
            return Err(CooldownConfigError::EmptyMedianWindow);
        }
        if self.max_change_percent == 0 || self.max_change_percent > 100 {
            return Err(CooldownConfigError::BadChangePercent(self.max_change_percent));
        }
        Ok(())
    }
}

/// The adaptive cooldown engine.
///
/// Append-only per window: one writer records registrations and closes
/// windows; readers take the current applied value by copy. State is small
/// (bounded by `median_window` + `smooth_windows`) and serializable for the
/// durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveCooldown {
    config: CooldownConfig,
    /// Window currently accumulating registrations.
    current_window: u64,
    /// Registrations observed in `current_window` so far.
    current_count: u64,
    /// Per-window counts for the trailing median (zero windows included).
    counts: VecDeque<u64>,
    /// Medians of closed windows, trailing `smooth_windows`.
    medians: VecDeque<u64>,
    /// Applied cooldown as of the last closed window.
    applied: u64,
    /// Total closed windows (cold-start detection).
    closed: u64,
}

impl AdaptiveCooldown {
    pub fn new() -> Self {
        Self::with_config(CooldownConfig::default())
            .expect("default cooldown config is valid")
    }

    pub fn with_config(config: CooldownConfig) -> Result<Self, CooldownConfigError> {
        config.validate()?;
        let applied = config.min;
        Ok(Self {
            config,
            current_window: 0,
            current_count: 0,
            counts: VecDeque::new(),
            medians: VecDeque::new(),
            applied,
            closed: 0,
        })
    }

    pub fn config(&self) -> &CooldownConfig {
        &self.config
    }

    /// Record one new-identity registration observed in `window`.
    ///
    /// Windows only move forward; a registration stamped into an already
    /// closed window is counted in the current one (late gossip).
    pub fn record_registration(&mut self, window: u64) {
        self.roll_to(window);
        self.current_count = self.current_count.saturating_add(1);
    }

    /// Advance to `window`, closing every window boundary crossed.
    pub fn roll_to(&mut self, window: u64) {
        while self.current_window < window {
            self.close_current();
        }
    }

    /// Number of closed windows so far.
    pub fn closed_windows(&self) -> u64 {
        self.closed
    }

    /// Cold start: not enough closed windows for a trustworthy baseline.
    pub fn is_cold_start(&self) -> bool {
        self.closed < self.config.smooth_windows
    }

    /// Median smoothed over the trailing closed windows, or `None` during
    /// cold start.
    pub fn smoothed_median(&self) -> Option<u64> {
        if self.is_cold_start() || self.medians.is_empty() {
            return None;
        }
        let sum: u64 = self.medians.iter().sum();
        Some(sum / self.medians.len() as u64)
    }

    /// Raw cooldown for a pending registration given the live count of the
    /// current window. Pure curve, before the per-window change limit.
    pub fn raw_cooldown(&self) -> u64 {
        let Some(smoothed) = self.smoothed_median() else {
            // Cold start / genesis: default, never a failure.
            return self.config.min;
        };
        self.curve(self.current_count, smoothed)
    }

    /// Cooldown applied to registrations right now: the raw value,
    /// rate-limited against the previous window's applied value.
    pub fn current_cooldown(&self) -> u64 {
        self.limit_change(self.raw_cooldown(), self.applied)
    }

    /// Applied value as of the last window close.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    /// Live registration count of the open window.
    pub fn current_count(&self) -> u64 {
        self.current_count
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// The two-segment piecewise-linear curve, integer arithmetic only.
    fn curve(&self, count: u64, smoothed: u64) -> u64 {
        let (min, mid, max) = (self.config.min, self.config.mid, self.config.max);
        if smoothed == 0 {
            // No baseline but history exists: any registration is an
            // infinite ratio, price it at the ceiling.
            return if count == 0 { min } else { max };
        }
        let raw = if count <= smoothed {
            // min + ratio * (mid - min)
            min + ((count as u128 * (mid - min) as u128) / smoothed as u128) as u64
        } else {
            // mid + (ratio - 1) * (max - mid)
            let over = (count - smoothed) as u128;
            let scaled = (over * (max - mid) as u128) / smoothed as u128;
            mid.saturating_add(scaled.min(u64::MAX as u128) as u64)
        };
        raw.clamp(min, max)
    }

    /// Clamp `next` to ±max_change_percent of `prev`.
    ///
    /// The delta is at least one window so a tiny applied value can still
    /// move; the result always stays inside [min, max].
    fn limit_change(&self, next: u64, prev: u64) -> u64 {
        let pct = self.config.max_change_percent;
        let delta = ((prev as u128 * pct as u128) / 100).max(1) as u64;
        let lo = prev.saturating_sub(delta);
        let hi = prev.saturating_add(delta);
        next.clamp(lo, hi).clamp(self.config.min, self.config.max)
    }

    /// Close the open window: fold its count into the median history,
    /// recompute the smoothed median, and advance the applied value one
    /// rate-limited step toward the raw curve.
    fn close_current(&mut self) {
        self.counts.push_back(self.current_count);
        while self.counts.len() as u64 > self.config.median_window {
            self.counts.pop_front();
        }

        let median = Self::median_of(&self.counts);
        self.medians.push_back(median);
        while self.medians.len() as u64 > self.config.smooth_windows {
            self.medians.pop_front();
        }

        self.closed += 1;

        let raw = if self.is_cold_start() {
            self.config.min
        } else {
            let smoothed = self.smoothed_median().unwrap_or(0);
            self.curve(self.current_count, smoothed)
        };
        let next_applied = self.limit_change(raw, self.applied);
        if next_applied != self.applied {
            debug!(
                window = self.current_window,
                from = self.applied,
                to = next_applied,
                raw,
                "cooldown step"
            );
        }
        self.applied = next_applied;

        self.current_window += 1;
        self.current_count = 0;
    }

    fn median_of(counts: &VecDeque<u64>) -> u64 {
        if counts.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = counts.iter().copied().collect();
        sorted.sort_unstable();
        sorted[sorted.len() / 2]
    }
}

impl Default for AdaptiveCooldown {
    fn default() -> Self {
        Self::new()
    }
}
