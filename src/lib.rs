pub mod cooldown;
pub mod crypto;
pub mod db;
pub mod leader;
pub mod net;
pub mod registry;
pub mod types;

// Cooldown exports
pub use cooldown::{AdaptiveCooldown, CooldownConfig, CooldownConfigError};
pub use crypto::{
    sha3, Fido2Flags, Fido2Verifier, UniquenessOracle, VdfVerifier, VrfOutput, VrfProof,
    VrfVerifier,
};
pub use db::{DbError, Storage};
pub use registry::{
    EligibleIdentity, IdentityRecord, PresenceRegistry, RegistryError, RegistrySnapshot,
    RegistryStats,
};

// Leader selection exports
pub use leader::{
    Checkpoint, LeaderSelector, MissedReason, Participant, SelectionError, SelectorStats,
    SlotOutcome, SlotResult,
};

// Network exports
pub use net::{NetConfig, NetService};
pub use types::*;
