//! Presence registry — the join/cooldown ledger.
//!
//! Every new identity passes through here exactly once: uniqueness oracle,
//! tier verification (FIDO2 for Verified Users), then a cooldown priced by
//! the adaptive engine. After cooldown the identity becomes eligible for the
//! leader lottery as long as it keeps showing up; go dark for longer than
//! the reactivation horizon and the cooldown applies again.
//!
//! # Concurrency
//!
//! One writer serializes registrations and window rollover. Readers never
//! touch the live maps: they take the immutable [`RegistrySnapshot`] that is
//! rebuilt and swapped atomically at each window close.

use crate::cooldown::AdaptiveCooldown;
use crate::crypto::{pubkey_fingerprint, Fido2Flags, Fido2Verifier, UniquenessOracle};
use crate::db::{DbError, Storage};
use crate::types::{CooldownStatus, PublicKey, Tier, REACTIVATION_HORIZON};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("identity already registered")]
    AlreadyRegistered,
    #[error("uniqueness oracle rejected registration")]
    NotFirstRegistration,
    #[error("unknown identity")]
    UnknownIdentity,
    #[error("verified-user registration requires a FIDO2 assertion")]
    MissingAssertion,
    #[error("FIDO2 assertion rejected")]
    AssertionRejected,
    #[error("FIDO2 flags insufficient: user_present={up}, user_verified={uv}")]
    InsufficientFlags { up: bool, uv: bool },
    #[error("storage error: {0}")]
    Db(#[from] DbError),
}

/// One registered identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub pubkey: PublicKey,
    pub tier: Tier,
    pub registered_window: u64,
    /// Window at which cooldown ends (eligibility begins).
    pub cooldown_until: u64,
    /// Raw FIDO2 authenticator flag byte, Verified Users only.
    pub fido2_flags: Option<u8>,
    /// Last window with an observed presence (0 = never).
    pub last_active_window: u64,
    /// Cumulative windows with presence.
    pub presence_windows: u64,
    /// Genesis identities carry no cooldown.
    pub is_genesis: bool,
}

impl IdentityRecord {
    pub fn new(pubkey: PublicKey, tier: Tier, registered_window: u64, cooldown_until: u64) -> Self {
        Self {
            pubkey,
            tier,
            registered_window,
            cooldown_until,
            fido2_flags: None,
            last_active_window: 0,
            presence_windows: 0,
            is_genesis: false,
        }
    }

    pub fn genesis(pubkey: PublicKey, tier: Tier) -> Self {
        Self {
            pubkey,
            tier,
            registered_window: 0,
            cooldown_until: 0,
            fido2_flags: None,
            last_active_window: 0,
            presence_windows: 0,
            is_genesis: true,
        }
    }

    pub fn fido2(&self) -> Option<Fido2Flags> {
        self.fido2_flags.map(Fido2Flags::from_byte)
    }

    pub fn in_cooldown(&self, current_window: u64) -> bool {
        if self.is_genesis {
            return false;
        }
        current_window < self.cooldown_until
    }

    pub fn cooldown_status(&self, current_window: u64) -> CooldownStatus {
        if self.in_cooldown(current_window) {
            CooldownStatus::Active { until_window: self.cooldown_until }
        } else {
            CooldownStatus::Completed
        }
    }

    /// Offline past the reactivation horizon: cooldown applies again before
    /// eligibility returns.
    pub fn needs_reactivation(&self, current_window: u64) -> bool {
        if self.is_genesis || self.last_active_window == 0 {
            return false;
        }
        current_window.saturating_sub(self.last_active_window) > REACTIVATION_HORIZON
    }

    /// Eligible for the leader lottery: past cooldown, and — for Verified
    /// Users — carrying both hardware-asserted flags.
    pub fn is_eligible(&self, current_window: u64) -> bool {
        if self.in_cooldown(current_window) {
            return false;
        }
        match self.tier {
            Tier::FullNode => true,
            Tier::VerifiedUser => self.fido2().is_some_and(|f| f.is_fully_verified()),
        }
    }
}

/// Immutable eligibility snapshot handed to readers.
#[derive(Debug, Clone, Default)]
pub struct RegistrySnapshot {
    pub window: u64,
    /// Identities past cooldown with valid tier verification.
    pub eligible: Vec<EligibleIdentity>,
    /// Applied cooldown at the snapshot window, in windows.
    pub current_cooldown: u64,
}

#[derive(Debug, Clone)]
pub struct EligibleIdentity {
    pub pubkey: PublicKey,
    pub tier: Tier,
}

/// Aggregate counters for operators. Per-identity traces stay at debug.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub identities: usize,
    pub eligible: usize,
    pub in_cooldown: usize,
    pub current_cooldown: u64,
    pub window: u64,
    pub rejected_registrations: u64,
    pub reactivations: u64,
}

pub struct PresenceRegistry {
    storage: Storage,
    cooldown: AdaptiveCooldown,
    identities: HashMap<PublicKey, IdentityRecord>,
    snapshot: Arc<RegistrySnapshot>,
    current_window: u64,
    rejected_registrations: u64,
    reactivations: u64,
}

impl PresenceRegistry {
    /// Open the registry over a durable store, restoring identity records
    /// and the cooldown window history from a previous run.
    pub fn open(storage: Storage, current_window: u64) -> Result<Self, RegistryError> {
        let cooldown = match storage.get_cooldown() {
            Ok(mut restored) => {
                restored.roll_to(current_window);
                restored
            }
            Err(DbError::NotFound) => AdaptiveCooldown::new(),
            Err(e) => {
                warn!("cooldown history unreadable, restarting from genesis defaults: {e}");
                AdaptiveCooldown::new()
            }
        };

        let mut identities = HashMap::new();
        for record in storage.get_all_identities()? {
            identities.insert(record.pubkey.clone(), record);
        }
        info!(
            identities = identities.len(),
            applied_cooldown = cooldown.applied(),
            "presence registry restored"
        );

        let mut registry = Self {
            storage,
            cooldown,
            identities,
            snapshot: Arc::new(RegistrySnapshot::default()),
            current_window,
            rejected_registrations: 0,
            reactivations: 0,
        };
        registry.rebuild_snapshot();
        Ok(registry)
    }

    /// Register a new identity.
    ///
    /// Verified Users must present a FIDO2 assertion whose verified flags
    /// carry both User-Present and User-Verified. The cooldown charged is
    /// the current applied value; the registration itself feeds the next
    /// window's pricing.
    pub fn register(
        &mut self,
        pubkey: PublicKey,
        tier: Tier,
        assertion: Option<&[u8]>,
        oracle: &dyn UniquenessOracle,
        fido2: &dyn Fido2Verifier,
    ) -> Result<IdentityRecord, RegistryError> {
        if self.identities.contains_key(&pubkey) {
            self.rejected_registrations += 1;
            return Err(RegistryError::AlreadyRegistered);
        }
        if !oracle.is_first_registration(&pubkey) {
            self.rejected_registrations += 1;
            return Err(RegistryError::NotFirstRegistration);
        }

        let flags = match tier {
            Tier::FullNode => None,
            Tier::VerifiedUser => {
                let blob = assertion.ok_or_else(|| {
                    self.rejected_registrations += 1;
                    RegistryError::MissingAssertion
                })?;
                let flags = fido2.verify_assertion(blob).ok_or_else(|| {
                    self.rejected_registrations += 1;
                    RegistryError::AssertionRejected
                })?;
                if !flags.is_fully_verified() {
                    self.rejected_registrations += 1;
                    return Err(RegistryError::InsufficientFlags {
                        up: flags.user_present,
                        uv: flags.user_verified,
                    });
                }
                Some(flags)
            }
        };

        let cooldown_windows = self.cooldown.current_cooldown();
        let mut record = IdentityRecord::new(
            pubkey.clone(),
            tier,
            self.current_window,
            self.current_window + cooldown_windows,
        );
        record.fido2_flags = flags.map(|f| {
            let mut b = 0u8;
            if f.user_present {
                b |= Fido2Flags::UP_BIT;
            }
            if f.user_verified {
                b |= Fido2Flags::UV_BIT;
            }
            b
        });

        self.cooldown.record_registration(self.current_window);
        self.storage.put_identity(&record)?;
        self.identities.insert(pubkey.clone(), record.clone());

        debug!(
            pubkey = %pubkey_fingerprint(&pubkey),
            tier = ?tier,
            cooldown_windows,
            "identity registered"
        );
        Ok(record)
    }

    /// Seed a genesis identity (no cooldown). Only meaningful before the
    /// first window closes.
    pub fn register_genesis(&mut self, pubkey: PublicKey, tier: Tier) -> Result<(), RegistryError> {
        if self.identities.contains_key(&pubkey) {
            return Err(RegistryError::AlreadyRegistered);
        }
        let record = IdentityRecord::genesis(pubkey.clone(), tier);
        self.storage.put_identity(&record)?;
        self.identities.insert(pubkey, record);
        Ok(())
    }

    /// Record an observed presence for an identity. A return from beyond the
    /// reactivation horizon re-enters cooldown at the current applied value.
    pub fn mark_active(&mut self, pubkey: &PublicKey, window: u64) -> Result<(), RegistryError> {
        let reactivation = self.cooldown.current_cooldown();
        let Some(record) = self.identities.get_mut(pubkey) else {
            return Err(RegistryError::UnknownIdentity);
        };

        if record.needs_reactivation(window) {
            record.cooldown_until = window + reactivation;
            self.reactivations += 1;
            info!(
                pubkey = %pubkey_fingerprint(pubkey),
                until = record.cooldown_until,
                "identity returned after long absence, reactivation cooldown applied"
            );
        }

        record.last_active_window = window;
        record.presence_windows += 1;
        self.storage.put_identity(record)?;
        Ok(())
    }

    /// Cooldown remaining for an identity at `window`, in windows. Zero for
    /// eligible or unknown identities; the registration handler uses the
    /// engine's applied value for brand-new keys.
    pub fn cooldown_for(&self, pubkey: &PublicKey, window: u64) -> u64 {
        match self.identities.get(pubkey) {
            Some(record) if record.in_cooldown(window) => record.cooldown_until - window,
            Some(_) => 0,
            None => self.cooldown.current_cooldown(),
        }
    }

    /// Close every window up to `window` and swap in a fresh snapshot.
    /// Single-writer: the maintenance task is the only caller.
    pub fn close_window(&mut self, window: u64) -> Result<(), RegistryError> {
        if window <= self.current_window {
            return Ok(());
        }
        self.cooldown.roll_to(window);
        self.current_window = window;
        self.rebuild_snapshot();
        self.storage.put_cooldown(&self.cooldown)?;
        self.storage.flush()?;
        debug!(
            window,
            eligible = self.snapshot.eligible.len(),
            cooldown = self.cooldown.applied(),
            "registry window closed"
        );
        Ok(())
    }

    /// Current immutable snapshot. Cheap Arc clone, safe to hold across
    /// await points.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.snapshot)
    }

    pub fn current_window(&self) -> u64 {
        self.current_window
    }

    pub fn cooldown_engine(&self) -> &AdaptiveCooldown {
        &self.cooldown
    }

    pub fn get(&self, pubkey: &PublicKey) -> Option<&IdentityRecord> {
        self.identities.get(pubkey)
    }

    pub fn stats(&self) -> RegistryStats {
        let eligible = self
            .identities
            .values()
            .filter(|r| r.is_eligible(self.current_window))
            .count();
        let in_cooldown = self
            .identities
            .values()
            .filter(|r| r.in_cooldown(self.current_window))
            .count();
        RegistryStats {
            identities: self.identities.len(),
            eligible,
            in_cooldown,
            current_cooldown: self.cooldown.current_cooldown(),
            window: self.current_window,
            rejected_registrations: self.rejected_registrations,
            reactivations: self.reactivations,
        }
    }

    fn rebuild_snapshot(&mut self) {
        let mut eligible: Vec<EligibleIdentity> = self
            .identities
            .values()
            .filter(|r| r.is_eligible(self.current_window))
            .map(|r| EligibleIdentity { pubkey: r.pubkey.clone(), tier: r.tier })
            .collect();
        // Deterministic order so every node builds the identical snapshot
        eligible.sort_by(|a, b| a.pubkey.cmp(&b.pubkey));

        self.snapshot = Arc::new(RegistrySnapshot {
            window: self.current_window,
            eligible,
            current_cooldown: self.cooldown.current_cooldown(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Fido2Flags;

    struct OpenOracle;
    impl UniquenessOracle for OpenOracle {
        fn is_first_registration(&self, _pubkey: &PublicKey) -> bool {
            true
        }
    }

    struct ClosedOracle;
    impl UniquenessOracle for ClosedOracle {
        fn is_first_registration(&self, _pubkey: &PublicKey) -> bool {
            false
        }
    }

    /// Treats the first blob byte as the authenticator flag byte.
    struct ByteFlagVerifier;
    impl Fido2Verifier for ByteFlagVerifier {
        fn verify_assertion(&self, blob: &[u8]) -> Option<Fido2Flags> {
            blob.first().map(|b| Fido2Flags::from_byte(*b))
        }
    }

    fn open_registry(window: u64) -> PresenceRegistry {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        PresenceRegistry::open(storage, window).unwrap()
    }

    #[test]
    fn test_full_node_registration_gets_cooldown() {
        let mut reg = open_registry(10);
        let record = reg
            .register(vec![1u8; 32], Tier::FullNode, None, &OpenOracle, &ByteFlagVerifier)
            .unwrap();

        assert!(record.in_cooldown(10));
        assert!(!record.is_eligible(10));
        // Cold start: cooldown defaults to MIN (1 day = 144 windows)
        assert_eq!(record.cooldown_until, 10 + 144);
        assert!(record.is_eligible(10 + 144));
    }

    #[test]
    fn test_duplicate_and_oracle_rejection() {
        let mut reg = open_registry(0);
        reg.register(vec![1u8; 32], Tier::FullNode, None, &OpenOracle, &ByteFlagVerifier)
            .unwrap();

        assert!(matches!(
            reg.register(vec![1u8; 32], Tier::FullNode, None, &OpenOracle, &ByteFlagVerifier),
            Err(RegistryError::AlreadyRegistered)
        ));
        assert!(matches!(
            reg.register(vec![2u8; 32], Tier::FullNode, None, &ClosedOracle, &ByteFlagVerifier),
            Err(RegistryError::NotFirstRegistration)
        ));
        assert_eq!(reg.stats().rejected_registrations, 2);
    }

    #[test]
    fn test_verified_user_requires_both_flags() {
        let mut reg = open_registry(0);

        // User-Present alone is rejected
        let up_only = [Fido2Flags::UP_BIT];
        assert!(matches!(
            reg.register(
                vec![1u8; 32],
                Tier::VerifiedUser,
                Some(&up_only),
                &OpenOracle,
                &ByteFlagVerifier
            ),
            Err(RegistryError::InsufficientFlags { up: true, uv: false })
        ));

        // Missing assertion entirely
        assert!(matches!(
            reg.register(vec![2u8; 32], Tier::VerifiedUser, None, &OpenOracle, &ByteFlagVerifier),
            Err(RegistryError::MissingAssertion)
        ));

        // Both flags pass
        let both = [Fido2Flags::UP_BIT | Fido2Flags::UV_BIT];
        let record = reg
            .register(
                vec![3u8; 32],
                Tier::VerifiedUser,
                Some(&both),
                &OpenOracle,
                &ByteFlagVerifier,
            )
            .unwrap();
        assert!(record.fido2().unwrap().is_fully_verified());
    }

    #[test]
    fn test_genesis_skips_cooldown() {
        let mut reg = open_registry(0);
        reg.register_genesis(vec![1u8; 32], Tier::FullNode).unwrap();
        let record = reg.get(&vec![1u8; 32]).unwrap();
        assert!(!record.in_cooldown(0));
        assert!(record.is_eligible(0));
    }

    #[test]
    fn test_snapshot_swaps_at_window_close() {
        let mut reg = open_registry(0);
        reg.register_genesis(vec![1u8; 32], Tier::FullNode).unwrap();

        let before = reg.snapshot();
        assert_eq!(before.window, 0);
        // Genesis node registered after the snapshot was built
        assert!(before.eligible.is_empty());

        reg.close_window(1).unwrap();
        let after = reg.snapshot();
        assert_eq!(after.window, 1);
        assert_eq!(after.eligible.len(), 1);
        // The old Arc still reads consistently
        assert_eq!(before.window, 0);
    }

    #[test]
    fn test_reactivation_after_long_absence() {
        let mut reg = open_registry(0);
        let key = vec![1u8; 32];
        reg.register(key.clone(), Tier::FullNode, None, &OpenOracle, &ByteFlagVerifier)
            .unwrap();

        // Active just past the initial cooldown (144 windows at cold start)
        reg.mark_active(&key, 150).unwrap();
        assert!(reg.get(&key).unwrap().is_eligible(150));

        // Return after more than REACTIVATION_HORIZON windows offline
        let late = 150 + REACTIVATION_HORIZON + 1;
        reg.mark_active(&key, late).unwrap();
        let record = reg.get(&key).unwrap();
        assert!(record.in_cooldown(late));
        assert_eq!(reg.stats().reactivations, 1);

        // Genesis identities never re-enter cooldown
        assert!(matches!(
            reg.mark_active(&vec![9u8; 32], late),
            Err(RegistryError::UnknownIdentity)
        ));
    }

    #[test]
    fn test_registry_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let storage = Storage::open(dir.path()).unwrap();
            let mut reg = PresenceRegistry::open(storage, 10).unwrap();
            reg.register(vec![1u8; 32], Tier::FullNode, None, &OpenOracle, &ByteFlagVerifier)
                .unwrap();
            reg.close_window(11).unwrap();
        }

        let storage = Storage::open(dir.path()).unwrap();
        let reg = PresenceRegistry::open(storage, 11).unwrap();
        let record = reg.get(&vec![1u8; 32]).unwrap();
        assert_eq!(record.registered_window, 10);
        assert_eq!(reg.cooldown_engine().closed_windows(), 1);
    }

    #[test]
    fn test_cooldown_for_unknown_key_quotes_applied_value() {
        let reg = open_registry(0);
        assert_eq!(reg.cooldown_for(&vec![9u8; 32], 0), 144);
    }
}
