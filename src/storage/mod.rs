//! Persistence interface for keys and session records.
//!
//! The engine never owns storage; everything durable goes through
//! [`ProtocolStore`]. Implementations decide where records live, but the
//! engine guarantees single-writer access per address through the job
//! queue, so a store only has to be a dumb key-value surface.
//!
//! [`MemoryStore`] is the bundled implementation used by tests and
//! short-lived processes. It keeps session records in their serialized
//! form, so every load exercises the same parse-and-migrate path a
//! durable store would.

use crate::crypto::{KeyPair, PreKeyPair, PublicKey, SignedPreKeyPair};
use crate::session::{ProtocolAddress, SessionRecord};
use crate::utils::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Durable state the session engine reads and writes
#[async_trait]
pub trait ProtocolStore: Send + Sync {
    /// Our long-term identity key pair
    async fn get_our_identity(&self) -> Result<KeyPair>;

    /// Our registration id
    async fn get_our_registration_id(&self) -> Result<u32>;

    /// Whether `identity_key` is acceptable for `address`.
    ///
    /// Returning `false` aborts the operation before any state changes.
    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &PublicKey,
    ) -> Result<bool>;

    /// The one-time prekey pair stored under `key_id`, if still present
    async fn load_pre_key(&self, key_id: u32) -> Result<Option<KeyPair>>;

    /// The signed prekey pair stored under `key_id`, if present
    async fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<KeyPair>>;

    /// Delete the one-time prekey under `key_id`; absent ids are a no-op
    async fn remove_pre_key(&self, key_id: u32) -> Result<()>;

    /// The session record for `address`, if one has been stored
    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>>;

    /// Persist the session record for `address`
    async fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<()>;
}

/// In-memory [`ProtocolStore`] with trust-on-first-use identity checks
pub struct MemoryStore {
    identity: KeyPair,
    registration_id: u32,
    trusted: Mutex<HashMap<String, PublicKey>>,
    pre_keys: Mutex<HashMap<u32, KeyPair>>,
    signed_pre_keys: Mutex<HashMap<u32, KeyPair>>,
    sessions: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    /// A store with a fresh identity and registration id
    pub fn new() -> Self {
        Self {
            identity: KeyPair::generate(),
            registration_id: crate::crypto::generate_registration_id(),
            trusted: Mutex::new(HashMap::new()),
            pre_keys: Mutex::new(HashMap::new()),
            signed_pre_keys: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Make a one-time prekey available for handshakes
    pub fn add_pre_key(&self, pre_key: PreKeyPair) {
        lock(&self.pre_keys).insert(pre_key.key_id, pre_key.key_pair);
    }

    /// Make a signed prekey available for handshakes
    pub fn add_signed_pre_key(&self, signed: SignedPreKeyPair) {
        lock(&self.signed_pre_keys).insert(signed.key_id, signed.key_pair);
    }

    /// Pin `identity_key` for `address`, overriding first-use trust
    pub fn set_trusted_identity(&self, address: &ProtocolAddress, identity_key: PublicKey) {
        lock(&self.trusted).insert(address.to_string(), identity_key);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolStore for MemoryStore {
    async fn get_our_identity(&self) -> Result<KeyPair> {
        Ok(self.identity.clone())
    }

    async fn get_our_registration_id(&self) -> Result<u32> {
        Ok(self.registration_id)
    }

    async fn is_trusted_identity(
        &self,
        address: &ProtocolAddress,
        identity_key: &PublicKey,
    ) -> Result<bool> {
        let mut trusted = lock(&self.trusted);
        match trusted.get(&address.to_string()) {
            Some(pinned) => Ok(pinned == identity_key),
            None => {
                trusted.insert(address.to_string(), *identity_key);
                Ok(true)
            }
        }
    }

    async fn load_pre_key(&self, key_id: u32) -> Result<Option<KeyPair>> {
        Ok(lock(&self.pre_keys).get(&key_id).cloned())
    }

    async fn load_signed_pre_key(&self, key_id: u32) -> Result<Option<KeyPair>> {
        Ok(lock(&self.signed_pre_keys).get(&key_id).cloned())
    }

    async fn remove_pre_key(&self, key_id: u32) -> Result<()> {
        lock(&self.pre_keys).remove(&key_id);
        Ok(())
    }

    async fn load_session(&self, address: &ProtocolAddress) -> Result<Option<SessionRecord>> {
        lock(&self.sessions)
            .get(&address.to_string())
            .map(|json| SessionRecord::from_json(json))
            .transpose()
    }

    async fn store_session(
        &self,
        address: &ProtocolAddress,
        record: &SessionRecord,
    ) -> Result<()> {
        let json = record.to_json()?;
        lock(&self.sessions).insert(address.to_string(), json);
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
