//! Sled-based durable store for the defense core.
//!
//! Two things must survive restart (losing them resets Sybil-cost history
//! to genesis defaults): identity records and the cooldown window history.
//! The address tables persist separately to `peers.dat` (see `net::addrman`).

use crate::cooldown::AdaptiveCooldown;
use crate::registry::IdentityRecord;
use crate::types::PublicKey;
use sled::{Db, Tree};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("not found")]
    NotFound,
}

const COOLDOWN_KEY: &[u8] = b"cooldown";

pub struct Storage {
    db: Db,
    identities: Tree,
    meta: Tree,
}

impl Storage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let db = sled::open(path)?;
        let identities = db.open_tree("identities")?;
        let meta = db.open_tree("meta")?;
        Ok(Self { db, identities, meta })
    }

    // Identities

    pub fn put_identity(&self, record: &IdentityRecord) -> Result<(), DbError> {
        let value = bincode::serialize(record)?;
        self.identities.insert(&record.pubkey, value)?;
        Ok(())
    }

    pub fn get_identity(&self, pubkey: &PublicKey) -> Result<IdentityRecord, DbError> {
        let value = self.identities.get(pubkey)?.ok_or(DbError::NotFound)?;
        Ok(bincode::deserialize(&value)?)
    }

    pub fn get_all_identities(&self) -> Result<Vec<IdentityRecord>, DbError> {
        let mut records = Vec::new();
        for item in self.identities.iter() {
            let (_, value) = item?;
            records.push(bincode::deserialize(&value)?);
        }
        Ok(records)
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }

    // Cooldown window history

    pub fn put_cooldown(&self, cooldown: &AdaptiveCooldown) -> Result<(), DbError> {
        let value = bincode::serialize(cooldown)?;
        self.meta.insert(COOLDOWN_KEY, value)?;
        Ok(())
    }

    pub fn get_cooldown(&self) -> Result<AdaptiveCooldown, DbError> {
        let value = self.meta.get(COOLDOWN_KEY)?.ok_or(DbError::NotFound)?;
        Ok(bincode::deserialize(&value)?)
    }

    /// Flush everything to disk. Called at window close and on shutdown.
    pub fn flush(&self) -> Result<(), DbError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;

    #[test]
    fn test_identity_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();

        let record = IdentityRecord::new(vec![7u8; 32], Tier::FullNode, 100, 244);
        storage.put_identity(&record).unwrap();

        let loaded = storage.get_identity(&record.pubkey).unwrap();
        assert_eq!(loaded.pubkey, record.pubkey);
        assert_eq!(loaded.registered_window, 100);
        assert_eq!(loaded.cooldown_until, 244);

        assert!(matches!(
            storage.get_identity(&vec![9u8; 32]),
            Err(DbError::NotFound)
        ));
    }

    #[test]
    fn test_cooldown_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let mut cooldown = AdaptiveCooldown::new();
        for w in 0..10 {
            cooldown.record_registration(w);
            cooldown.roll_to(w + 1);
        }

        {
            let storage = Storage::open(dir.path()).unwrap();
            storage.put_cooldown(&cooldown).unwrap();
            storage.flush().unwrap();
        }

        let storage = Storage::open(dir.path()).unwrap();
        let restored = storage.get_cooldown().unwrap();
        assert_eq!(restored.closed_windows(), cooldown.closed_windows());
        assert_eq!(restored.applied(), cooldown.applied());
    }
}
