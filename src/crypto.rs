//! Cryptographic collaborator seam.
//!
//! This crate never implements signature, VRF, VDF, or attestation
//! primitives. It consumes them through the traits below, the same way the
//! consensus layer consumes signing through `Signer`/`Verifier` seams.
//! Implementations live in the crypto collaborator crate; tests use mocks.

use crate::types::{Hash, PublicKey};
use sha3::{Digest, Sha3_256};

/// SHA3-256 convenience wrapper. Used for all deterministic derivations.
pub fn sha3(data: &[u8]) -> Hash {
    Sha3_256::digest(data).into()
}

/// Short hex fingerprint of a public key for log lines.
pub fn pubkey_fingerprint(pubkey: &[u8]) -> String {
    let h = sha3(pubkey);
    hex::encode(&h[..8])
}

// =============================================================================
// VRF
// =============================================================================

/// VRF output (32 bytes). Compared as an unsigned big-endian integer when
/// ranking lottery tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VrfOutput(pub Hash);

impl VrfOutput {
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

/// VRF proof blob. Opaque — only the collaborator can interpret it.
pub type VrfProof = Vec<u8>;

/// Verifies a VRF proof against `(seed, pubkey)` and returns the bound
/// output, or `None` if the proof does not verify.
pub trait VrfVerifier: Send + Sync {
    fn verify_vrf(&self, seed: &Hash, proof: &VrfProof, pubkey: &PublicKey) -> Option<VrfOutput>;
}

// =============================================================================
// VDF
// =============================================================================

/// Verifies that a checkpoint's VDF output really anchors the claimed
/// sequence index (i.e. the required wall-clock time was spent).
pub trait VdfVerifier: Send + Sync {
    fn verify_vdf(&self, checkpoint: &crate::leader::Checkpoint) -> bool;
}

// =============================================================================
// FIDO2 / WEBAUTHN
// =============================================================================

/// Authenticator flags extracted from a verified FIDO2 assertion.
///
/// Flag byte layout follows WebAuthn authenticator data (byte 32):
/// bit 0 = User Present (physical interaction),
/// bit 2 = User Verified (biometric/PIN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fido2Flags {
    pub user_present: bool,
    pub user_verified: bool,
}

impl Fido2Flags {
    pub const UP_BIT: u8 = 0x01;
    pub const UV_BIT: u8 = 0x04;

    pub fn from_byte(flags: u8) -> Self {
        Self {
            user_present: flags & Self::UP_BIT != 0,
            user_verified: flags & Self::UV_BIT != 0,
        }
    }

    /// Both hardware assertions present — the bar for Verified User
    /// eligibility.
    pub fn is_fully_verified(&self) -> bool {
        self.user_present && self.user_verified
    }
}

/// Verifies a FIDO2 assertion blob (authData + signature + certificate
/// chain) and returns the authenticator flags, or `None` on any failure.
/// Parsing and chain validation happen in the collaborator.
pub trait Fido2Verifier: Send + Sync {
    fn verify_assertion(&self, blob: &[u8]) -> Option<Fido2Flags>;
}

// =============================================================================
// IDENTITY UNIQUENESS
// =============================================================================

/// External oracle answering "is this the first genesis registration for
/// this real-world identity?". One genesis registration per identity is
/// enforced here, not re-derived by this crate.
pub trait UniquenessOracle: Send + Sync {
    fn is_first_registration(&self, pubkey: &PublicKey) -> bool;
}
