//! Presence-gated leader selection.
//!
//! Every consensus slot is anchored by a VDF checkpoint — proof that real
//! wall-clock time passed since the previous one. The checkpoint seeds a
//! per-participant VRF; the participant with the numerically lowest output
//! inside the winning tier produces the slot.
//!
//! ```text
//! CORRECT:  seed = SHA3(domain ‖ vdf_output ‖ sequence)
//! WRONG:    seed = SHA3(domain ‖ vdf_output ‖ participant_set_root)
//!                                             ^^^^^^^^^^^^^^^^^^^^
//!                                             producer controls this!
//! ```
//!
//! # Tier split
//!
//! Full Nodes take 80% of slots, Verified Users 20%. The split is enforced
//! by giving each tier a disjoint sub-range of a checkpoint-derived draw in
//! [0, 100), recomputed per snapshot: a tier with no eligible participants
//! collapses its share to zero, so selection never lands on an empty tier.
//! Single pass, deterministic for a given checkpoint and participant set.
//!
//! # Missed slots
//!
//! No eligible participant, or a leader that fails to produce within the
//! slot timeout, yields a missed slot. The next checkpoint proceeds
//! independently — there is no intra-slot fallback leader; liveness belongs
//! to the surrounding protocol.

use crate::crypto::{pubkey_fingerprint, sha3, Fido2Flags, VdfVerifier, VrfOutput, VrfProof, VrfVerifier};
use crate::types::{Hash, PublicKey, Tier};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Domain separator for slot seeds. Bump on incompatible changes.
const SEED_DOMAIN: &[u8] = b"vigil/leader/v1";
const TIER_DOMAIN: &[u8] = b"vigil/tier/v1";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectionError {
    #[error("checkpoint failed VDF verification (sequence {0})")]
    InvalidCheckpoint(u64),
}

/// VDF-anchored time checkpoint. Owned by the time-oracle collaborator,
/// consumed read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub vdf_output: Hash,
    pub sequence: u64,
    pub timestamp: u64,
}

impl Checkpoint {
    /// Slot seed every participant's VRF is evaluated against.
    pub fn seed(&self) -> Hash {
        let mut data = Vec::with_capacity(SEED_DOMAIN.len() + 40);
        data.extend_from_slice(SEED_DOMAIN);
        data.extend_from_slice(&self.vdf_output);
        data.extend_from_slice(&self.sequence.to_le_bytes());
        sha3(&data)
    }

    /// Checkpoint-derived tier draw in [0, 100).
    fn tier_draw(&self) -> u64 {
        let mut data = Vec::with_capacity(TIER_DOMAIN.len() + 40);
        data.extend_from_slice(TIER_DOMAIN);
        data.extend_from_slice(&self.vdf_output);
        data.extend_from_slice(&self.sequence.to_le_bytes());
        let h = sha3(&data);
        u64::from_le_bytes(h[..8].try_into().expect("8-byte slice")) % 100
    }
}

/// Lottery participant: connected, past cooldown, with its VRF proof for
/// this slot. Verified Users additionally carry their verified FIDO2 flags.
#[derive(Debug, Clone)]
pub struct Participant {
    pub pubkey: PublicKey,
    pub tier: Tier,
    pub vrf_proof: VrfProof,
    /// Flags from the participant's latest verified assertion. Required for
    /// Verified Users; ignored for Full Nodes.
    pub fido2: Option<Fido2Flags>,
}

impl Participant {
    /// Tier-level eligibility. Full Nodes qualify as given; Verified Users
    /// need both User-Present and User-Verified hardware flags.
    pub fn tier_eligible(&self) -> bool {
        match self.tier {
            Tier::FullNode => true,
            Tier::VerifiedUser => self.fido2.is_some_and(|f| f.is_fully_verified()),
        }
    }
}

/// Result of a decided slot.
#[derive(Debug, Clone)]
pub struct SlotResult {
    pub sequence: u64,
    pub leader: PublicKey,
    pub tier: Tier,
    pub vrf_output: VrfOutput,
    /// Participants that survived eligibility and proof verification.
    pub eligible_count: usize,
    /// Participants dropped for invalid VRF proofs (integrity errors).
    pub rejected_proofs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissedReason {
    /// Nobody eligible at this checkpoint (starvation, surfaced upward).
    NoEligibleParticipants,
    /// Nominated leader failed to produce within the slot timeout.
    LeaderTimeout,
}

#[derive(Debug, Clone)]
pub enum SlotOutcome {
    Elected(SlotResult),
    Missed { sequence: u64, reason: MissedReason },
}

/// Aggregate counters for operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectorStats {
    pub elected_slots: u64,
    pub missed_slots: u64,
    pub rejected_proofs: u64,
}

pub struct LeaderSelector {
    vdf: Arc<dyn VdfVerifier>,
    vrf: Arc<dyn VrfVerifier>,
    stats: SelectorStats,
}

impl LeaderSelector {
    pub fn new(vdf: Arc<dyn VdfVerifier>, vrf: Arc<dyn VrfVerifier>) -> Self {
        Self { vdf, vrf, stats: SelectorStats::default() }
    }

    /// Select the leader for the slot anchored by `checkpoint`.
    ///
    /// Deterministic: the same checkpoint and participant set always yield
    /// the same outcome. Invalid VRF proofs exclude their participant and
    /// count as integrity errors; they never abort the slot.
    pub fn select(
        &mut self,
        checkpoint: &Checkpoint,
        participants: &[Participant],
    ) -> Result<SlotOutcome, SelectionError> {
        if !self.vdf.verify_vdf(checkpoint) {
            warn!(sequence = checkpoint.sequence, "checkpoint rejected by VDF verifier");
            return Err(SelectionError::InvalidCheckpoint(checkpoint.sequence));
        }

        let seed = checkpoint.seed();
        let mut rejected_proofs = 0usize;
        // (output, pubkey, tier): output first so min() is lowest-ticket,
        // pubkey second so exact ties fall to lexicographic key order.
        let mut verified: Vec<(VrfOutput, &PublicKey, Tier)> = Vec::with_capacity(participants.len());

        for p in participants {
            if !p.tier_eligible() {
                debug!(pubkey = %pubkey_fingerprint(&p.pubkey), "participant not tier-eligible");
                continue;
            }
            match self.vrf.verify_vrf(&seed, &p.vrf_proof, &p.pubkey) {
                Some(output) => verified.push((output, &p.pubkey, p.tier)),
                None => {
                    rejected_proofs += 1;
                    debug!(pubkey = %pubkey_fingerprint(&p.pubkey), "invalid VRF proof, participant dropped");
                }
            }
        }
        self.stats.rejected_proofs += rejected_proofs as u64;

        if verified.is_empty() {
            self.stats.missed_slots += 1;
            info!(sequence = checkpoint.sequence, "no eligible participants, slot missed");
            return Ok(SlotOutcome::Missed {
                sequence: checkpoint.sequence,
                reason: MissedReason::NoEligibleParticipants,
            });
        }

        let winning_tier = Self::winning_tier(checkpoint, &verified);
        let winner = verified
            .iter()
            .filter(|(_, _, tier)| *tier == winning_tier)
            .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)))
            .expect("winning tier recomputed from non-empty set");

        self.stats.elected_slots += 1;
        debug!(
            sequence = checkpoint.sequence,
            leader = %pubkey_fingerprint(winner.1),
            tier = ?winning_tier,
            "leader elected"
        );

        Ok(SlotOutcome::Elected(SlotResult {
            sequence: checkpoint.sequence,
            leader: winner.1.clone(),
            tier: winning_tier,
            vrf_output: winner.0,
            eligible_count: verified.len(),
            rejected_proofs,
        }))
    }

    /// Report that the nominated leader failed to produce within the slot
    /// timeout. The slot is marked missed; the next checkpoint proceeds
    /// independently.
    pub fn report_timeout(&mut self, sequence: u64) -> SlotOutcome {
        self.stats.missed_slots += 1;
        info!(sequence, "leader timeout, slot missed");
        SlotOutcome::Missed { sequence, reason: MissedReason::LeaderTimeout }
    }

    pub fn stats(&self) -> SelectorStats {
        self.stats
    }

    /// Pick the winning tier: checkpoint draw in [0, 100) against the
    /// Full-Node sub-range. Shares recomputed per snapshot so an empty tier
    /// never wins.
    fn winning_tier(checkpoint: &Checkpoint, verified: &[(VrfOutput, &PublicKey, Tier)]) -> Tier {
        let full_present = verified.iter().any(|(_, _, t)| *t == Tier::FullNode);
        let user_present = verified.iter().any(|(_, _, t)| *t == Tier::VerifiedUser);

        let full_share = match (full_present, user_present) {
            (true, false) => 100,
            (false, true) => 0,
            _ => Tier::FullNode.target_share(),
        };

        if checkpoint.tier_draw() < full_share {
            Tier::FullNode
        } else {
            Tier::VerifiedUser
        }
    }
}
