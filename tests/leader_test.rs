//! Leader selection: determinism, tier gating, missed slots.

use std::sync::Arc;
use vigil::{
    sha3, Checkpoint, Fido2Flags, LeaderSelector, MissedReason, Participant, SlotOutcome,
    Tier, VdfVerifier, VrfOutput, VrfProof, VrfVerifier,
};
use vigil::types::{Hash, PublicKey};

struct AcceptAllVdf;
impl VdfVerifier for AcceptAllVdf {
    fn verify_vdf(&self, _checkpoint: &Checkpoint) -> bool {
        true
    }
}

/// Deterministic VRF stand-in: output = SHA3(seed ‖ pubkey), proof must be
/// the literal bytes "ok".
struct HashVrf;
impl VrfVerifier for HashVrf {
    fn verify_vrf(&self, seed: &Hash, proof: &VrfProof, pubkey: &PublicKey) -> Option<VrfOutput> {
        if proof.as_slice() != b"ok" {
            return None;
        }
        let mut data = Vec::with_capacity(32 + pubkey.len());
        data.extend_from_slice(seed);
        data.extend_from_slice(pubkey);
        Some(VrfOutput(sha3(&data)))
    }
}

fn checkpoint(sequence: u64) -> Checkpoint {
    Checkpoint {
        vdf_output: sha3(&sequence.to_le_bytes()),
        sequence,
        timestamp: 1735862400 + sequence * 600,
    }
}

fn full_node(seed: u8) -> Participant {
    Participant {
        pubkey: vec![seed; 32],
        tier: Tier::FullNode,
        vrf_proof: b"ok".to_vec(),
        fido2: None,
    }
}

fn verified_user(seed: u8, flag_byte: u8) -> Participant {
    Participant {
        pubkey: vec![seed; 32],
        tier: Tier::VerifiedUser,
        vrf_proof: b"ok".to_vec(),
        fido2: Some(Fido2Flags::from_byte(flag_byte)),
    }
}

fn selector() -> LeaderSelector {
    LeaderSelector::new(Arc::new(AcceptAllVdf), Arc::new(HashVrf))
}

#[test]
fn repeated_selection_is_identical() {
    let participants: Vec<Participant> = (1..=20)
        .map(full_node)
        .chain((30..=35).map(|i| verified_user(i, 0x05)))
        .collect();

    let mut s = selector();
    for seq in [0u64, 1, 17, 999_999] {
        let cp = checkpoint(seq);
        let first = match s.select(&cp, &participants).unwrap() {
            SlotOutcome::Elected(r) => r,
            _ => panic!("expected election at sequence {seq}"),
        };
        for _ in 0..5 {
            match s.select(&cp, &participants).unwrap() {
                SlotOutcome::Elected(r) => {
                    assert_eq!(r.leader, first.leader);
                    assert_eq!(r.vrf_output, first.vrf_output);
                    assert_eq!(r.tier, first.tier);
                }
                _ => panic!("outcome changed between calls"),
            }
        }
    }
}

#[test]
fn participant_order_does_not_matter() {
    let mut forward: Vec<Participant> = (1..=12).map(full_node).collect();
    let mut s = selector();
    let cp = checkpoint(7);

    let a = match s.select(&cp, &forward).unwrap() {
        SlotOutcome::Elected(r) => r.leader,
        _ => panic!(),
    };
    forward.reverse();
    let b = match s.select(&cp, &forward).unwrap() {
        SlotOutcome::Elected(r) => r.leader,
        _ => panic!(),
    };
    assert_eq!(a, b);
}

#[test]
fn scenario_user_present_without_user_verified_is_excluded() {
    // A Verified User carrying only the User-Present flag is not eligible,
    // even though the hardware did assert physical presence.
    let up_only = verified_user(1, Fido2Flags::UP_BIT);
    let complete = verified_user(2, Fido2Flags::UP_BIT | Fido2Flags::UV_BIT);

    let mut s = selector();
    match s.select(&checkpoint(9), &[up_only.clone(), complete]).unwrap() {
        SlotOutcome::Elected(result) => {
            assert_eq!(result.leader, vec![2u8; 32]);
            assert_eq!(result.eligible_count, 1);
        }
        _ => panic!("expected election"),
    }

    match s.select(&checkpoint(9), &[up_only]).unwrap() {
        SlotOutcome::Missed { reason, .. } => {
            assert_eq!(reason, MissedReason::NoEligibleParticipants)
        }
        _ => panic!("expected missed slot"),
    }
}

#[test]
fn tier_split_tracks_eighty_twenty() {
    let participants: Vec<Participant> = (1..=16)
        .map(full_node)
        .chain((40..=43).map(|i| verified_user(i, 0x05)))
        .collect();

    let mut s = selector();
    let mut full = 0u32;
    let mut user = 0u32;
    for seq in 0..1000 {
        match s.select(&checkpoint(seq), &participants).unwrap() {
            SlotOutcome::Elected(r) => match r.tier {
                Tier::FullNode => full += 1,
                Tier::VerifiedUser => user += 1,
            },
            _ => panic!("expected election"),
        }
    }
    // 80/20 target with sampling slack
    assert!((700..=900).contains(&full), "full nodes won {full}/1000");
    assert!((100..=300).contains(&user), "verified users won {user}/1000");
}

#[test]
fn missed_slot_has_no_intra_slot_fallback() {
    let mut s = selector();

    // Starvation: no participants at all
    match s.select(&checkpoint(3), &[]).unwrap() {
        SlotOutcome::Missed { sequence, reason } => {
            assert_eq!(sequence, 3);
            assert_eq!(reason, MissedReason::NoEligibleParticipants);
        }
        _ => panic!("expected missed slot"),
    }

    // Leader timeout: reported by the production loop, marked missed
    match s.report_timeout(4) {
        SlotOutcome::Missed { sequence, reason } => {
            assert_eq!(sequence, 4);
            assert_eq!(reason, MissedReason::LeaderTimeout);
        }
        _ => panic!("expected missed slot"),
    }

    assert_eq!(s.stats().missed_slots, 2);
    assert_eq!(s.stats().elected_slots, 0);
}

#[test]
fn forged_proofs_never_abort_the_slot() {
    let mut forged = full_node(1);
    forged.vrf_proof = b"not-a-proof".to_vec();
    let honest = full_node(2);

    let mut s = selector();
    match s.select(&checkpoint(12), &[forged, honest]).unwrap() {
        SlotOutcome::Elected(r) => {
            assert_eq!(r.leader, vec![2u8; 32]);
            assert_eq!(r.rejected_proofs, 1);
        }
        _ => panic!("expected election despite the forged proof"),
    }
}
