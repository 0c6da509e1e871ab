//! One-time authentication challenges.
//!
//! A challenge binds a random nonce to the public key that asked for it.
//! Retrieval consumes it; expiry is checked lazily on retrieval and the
//! background sweep only bounds memory.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use strata_core::{KeyType, PublicKey};

#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error("failed to gather randomness: {0}")]
    Randomness(#[from] rand::Error),
}

pub type Result<T> = std::result::Result<T, ChallengeError>;

/// Nonce length in bytes
pub const NONCE_LEN: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Challenge {
    pub id: String,
    pub nonce: Vec<u8>,
    /// Canonical form of the bound key
    pub public_key: String,
    pub key_type: KeyType,
    pub algorithm: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Challenge {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

pub struct ChallengeStore {
    ttl: Duration,
    inner: Mutex<HashMap<String, Challenge>>,
}

impl ChallengeStore {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl: Duration::from_std(ttl).unwrap_or_else(|_| Duration::seconds(30)),
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Challenge>> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Issue a challenge for `key`.
    pub fn create(&self, key: &PublicKey) -> Result<Challenge> {
        let mut nonce = vec![0u8; NONCE_LEN];
        rand::rngs::OsRng.try_fill_bytes(&mut nonce)?;

        let now = Utc::now();
        let key_type = key.key_type();
        let challenge = Challenge {
            id: uuid::Uuid::new_v4().to_string(),
            nonce,
            public_key: key.to_canonical(),
            key_type,
            algorithm: key_type.signature_algorithm().to_string(),
            created_at: now,
            expires_at: now + self.ttl,
        };

        self.lock().insert(challenge.id.clone(), challenge.clone());
        tracing::debug!(challenge_id = %challenge.id, key_type = %key_type, "Issued challenge");
        Ok(challenge)
    }

    /// Remove and return the challenge if it exists and has not expired.
    /// A second call for the same id always misses.
    pub fn get(&self, id: &str) -> Option<Challenge> {
        self.take_at(id, Utc::now())
    }

    fn take_at(&self, id: &str, now: DateTime<Utc>) -> Option<Challenge> {
        let challenge = self.lock().remove(id)?;
        if challenge.is_expired(now) {
            tracing::debug!(challenge_id = %id, "Challenge expired");
            return None;
        }
        Some(challenge)
    }

    /// Drop expired challenges; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_at(Utc::now())
    }

    fn purge_at(&self, now: DateTime<Utc>) -> usize {
        let mut map = self.lock();
        let before = map.len();
        map.retain(|_, c| !c.is_expired(now));
        before - map.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::Keypair;

    fn test_key() -> PublicKey {
        PublicKey::parse(Keypair::generate().public_key_ssh().as_bytes()).unwrap()
    }

    #[test]
    fn challenge_has_fresh_nonce_and_expiry() {
        let store = ChallengeStore::new(std::time::Duration::from_secs(30));
        let key = test_key();
        let a = store.create(&key).unwrap();
        let b = store.create(&key).unwrap();

        assert_eq!(a.nonce.len(), NONCE_LEN);
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.id, b.id);
        assert_eq!(a.algorithm, "ed25519");
        assert_eq!(a.public_key, key.to_canonical());
        assert_eq!((a.expires_at - a.created_at).num_seconds(), 30);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn challenge_is_single_use() {
        let store = ChallengeStore::new(std::time::Duration::from_secs(30));
        let challenge = store.create(&test_key()).unwrap();

        assert_eq!(store.get(&challenge.id), Some(challenge.clone()));
        assert!(store.get(&challenge.id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn expired_challenge_misses_and_is_removed() {
        let store = ChallengeStore::new(std::time::Duration::from_secs(30));
        let challenge = store.create(&test_key()).unwrap();

        let later = challenge.expires_at + Duration::seconds(1);
        assert!(store.take_at(&challenge.id, later).is_none());
        assert!(store.get(&challenge.id).is_none());
    }

    #[test]
    fn purge_only_drops_expired() {
        let store = ChallengeStore::new(std::time::Duration::from_secs(30));
        let key = test_key();
        let first = store.create(&key).unwrap();
        store.create(&key).unwrap();

        assert_eq!(store.purge_at(first.created_at), 0);
        assert_eq!(store.purge_at(first.expires_at + Duration::seconds(60)), 2);
        assert!(store.is_empty());
    }

    #[test]
    fn unknown_id_misses() {
        let store = ChallengeStore::new(std::time::Duration::from_secs(30));
        assert!(store.get("nope").is_none());
    }
}
