//! Persistent session state: chains, entries, and the per-peer record.
//!
//! A [`SessionRecord`] holds every ratchet conversation ever established
//! with one peer device, keyed by the base key that created it. Only one
//! entry is open at a time; superseded entries are closed (timestamped, not
//! deleted) so that late messages targeting an older session still decrypt,
//! and the record is pruned to a bounded number of closed entries.
//!
//! Records persist as a versioned JSON document with all byte fields
//! base64-encoded. Loading a record with an older schema version applies
//! chained migrations; an unrecognized version is a hard error.

use crate::crypto::{KeyPair, PrivateKey, PublicKey};
use crate::utils::{Result, SessionError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Upper bound on retained entries; eviction removes oldest-closed first
pub const CLOSED_SESSIONS_MAX: usize = 40;

/// Current persisted schema version
pub const SESSION_RECORD_VERSION: &str = "v1";

/// Direction of a ratchet chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    /// Chain that produces keys for messages we send
    Sending,
    /// Chain that produces keys for messages we receive
    Receiving,
}

/// Which side generated the base key that established a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaseKeyOrigin {
    /// We initiated: the base key is our own ephemeral
    Ours,
    /// The peer initiated: the base key is theirs
    Theirs,
}

/// The advancing key at the head of a chain.
///
/// `counter` starts at −1 for a freshly derived chain; the first message
/// key produced carries counter 0. `key` becomes `None` when the chain is
/// closed by a ratchet step; cached message keys survive the closure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainKey {
    /// Counter of the last message key derived from this chain
    pub counter: i32,
    /// The chain key itself, absent once the chain is closed
    #[serde(with = "b64::opt_arr32")]
    pub key: Option<[u8; 32]>,
}

/// One directional sub-chain of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    /// Head of the chain
    pub chain_key: ChainKey,
    /// Direction tag
    pub chain_type: ChainType,
    /// Derived-but-unconsumed message keys, indexed by counter
    #[serde(with = "b64::message_keys")]
    pub message_keys: BTreeMap<u32, [u8; 32]>,
}

impl Chain {
    /// A fresh chain with the given head key and direction
    pub fn new(key: [u8; 32], chain_type: ChainType) -> Self {
        Self {
            chain_key: ChainKey {
                counter: -1,
                key: Some(key),
            },
            chain_type,
            message_keys: BTreeMap::new(),
        }
    }
}

/// The rolling DH-ratchet state of a session entry
#[derive(Clone, Serialize, Deserialize)]
pub struct CurrentRatchet {
    /// Our current ratchet ephemeral key pair
    #[serde(with = "b64::key_pair")]
    pub ephemeral_key_pair: KeyPair,
    /// The most recent ratchet key seen from the peer
    pub last_remote_ephemeral_key: PublicKey,
    /// Final counter of the sending chain replaced by the last ratchet step
    pub previous_counter: u32,
    /// Root key carried across ratchet steps
    #[serde(with = "b64::arr32")]
    pub root_key: [u8; 32],
}

/// Bookkeeping that identifies and orders a session entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexInfo {
    /// The base key that established this session
    pub base_key: PublicKey,
    /// Which side the base key came from
    pub base_key_origin: BaseKeyOrigin,
    /// When the entry was superseded; `None` while open
    pub closed: Option<DateTime<Utc>>,
    /// Last time the entry encrypted or decrypted a message
    pub used: DateTime<Utc>,
    /// When the entry was created
    pub created: DateTime<Utc>,
    /// The peer's long-term identity key
    pub remote_identity_key: PublicKey,
}

/// Handshake material retained until the peer's first reply confirms the
/// session; while present, outgoing messages carry the prekey-bundle frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPreKey {
    /// Our base key, repeated in every prekey-bundle frame
    pub base_key: PublicKey,
    /// Id of the peer's signed prekey used in the handshake
    pub signed_key_id: u32,
    /// Id of the peer's one-time prekey, if one was consumed
    pub pre_key_id: Option<u32>,
}

/// One complete ratchet conversation instance
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    /// The peer's registration id, when known
    pub registration_id: Option<u32>,
    /// Rolling ratchet state
    pub current_ratchet: CurrentRatchet,
    /// Identity and ordering bookkeeping
    pub index_info: IndexInfo,
    /// Set between the outgoing handshake and the first confirmed decrypt
    pub pending_pre_key: Option<PendingPreKey>,
    #[serde(with = "b64::chain_map")]
    chains: BTreeMap<Vec<u8>, Chain>,
}

impl SessionEntry {
    /// Build a new entry from its parts, with no chains yet
    pub fn new(
        registration_id: Option<u32>,
        current_ratchet: CurrentRatchet,
        index_info: IndexInfo,
    ) -> Self {
        Self {
            registration_id,
            current_ratchet,
            index_info,
            pending_pre_key: None,
            chains: BTreeMap::new(),
        }
    }

    /// True once this entry has been superseded
    pub fn is_closed(&self) -> bool {
        self.index_info.closed.is_some()
    }

    /// Mark the entry superseded, timestamping the closure
    pub fn close(&mut self) {
        if self.is_closed() {
            log::warn!("Session already closed: {self:?}");
            return;
        }
        log::info!("Closing session: {self:?}");
        self.index_info.closed = Some(Utc::now());
    }

    /// Add a chain keyed by the ephemeral key that produced it
    pub fn add_chain(&mut self, key: &PublicKey, chain: Chain) -> Result<()> {
        let id = key.encode().to_vec();
        if self.chains.contains_key(&id) {
            return Err(SessionError::DuplicateChain.into());
        }
        self.chains.insert(id, chain);
        Ok(())
    }

    /// Look up the chain for an ephemeral key
    pub fn chain(&self, key: &PublicKey) -> Option<&Chain> {
        self.chains.get(key.encode().as_slice())
    }

    /// Mutable lookup of the chain for an ephemeral key
    pub fn chain_mut(&mut self, key: &PublicKey) -> Option<&mut Chain> {
        self.chains.get_mut(key.encode().as_slice())
    }

    /// Remove the chain for an ephemeral key
    pub fn delete_chain(&mut self, key: &PublicKey) -> Result<()> {
        match self.chains.remove(key.encode().as_slice()) {
            Some(_) => Ok(()),
            None => Err(SessionError::UnknownChain.into()),
        }
    }

    /// Iterate over all (encoded ephemeral key, chain) pairs
    pub fn chains(&self) -> impl Iterator<Item = (&[u8], &Chain)> {
        self.chains.iter().map(|(k, v)| (k.as_slice(), v))
    }
}

impl fmt::Debug for SessionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<SessionEntry [baseKey={} closed={:?}]>",
            self.index_info.base_key.to_base64(),
            self.index_info.closed
        )
    }
}

/// All session entries for one peer device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    version: String,
    sessions: BTreeMap<String, SessionEntry>,
}

impl SessionRecord {
    /// An empty record at the current schema version
    pub fn new() -> Self {
        Self {
            version: SESSION_RECORD_VERSION.to_string(),
            sessions: BTreeMap::new(),
        }
    }

    /// Look up the entry established by `base_key`.
    ///
    /// Incoming-message matching must never resolve to a session whose base
    /// key is our own; that indicates reflected traffic and is an error.
    pub fn get_session(&self, base_key: &PublicKey) -> Result<Option<&SessionEntry>> {
        match self.sessions.get(&base_key.to_base64()) {
            Some(entry) if entry.index_info.base_key_origin == BaseKeyOrigin::Ours => {
                Err(SessionError::ReflectedBaseKey.into())
            }
            other => Ok(other),
        }
    }

    /// Mutable variant of [`Self::get_session`], same reflection guard
    pub fn get_session_mut(&mut self, base_key: &PublicKey) -> Result<Option<&mut SessionEntry>> {
        match self.sessions.get_mut(&base_key.to_base64()) {
            Some(entry) if entry.index_info.base_key_origin == BaseKeyOrigin::Ours => {
                Err(SessionError::ReflectedBaseKey.into())
            }
            other => Ok(other),
        }
    }

    /// Insert or replace the entry keyed by its own base key
    pub fn set_session(&mut self, entry: SessionEntry) {
        self.sessions
            .insert(entry.index_info.base_key.to_base64(), entry);
    }

    /// The open entry, if one exists
    pub fn get_open_session(&self) -> Option<&SessionEntry> {
        self.sessions.values().find(|entry| !entry.is_closed())
    }

    /// Mutable access to the open entry, if one exists
    pub fn get_open_session_mut(&mut self) -> Option<&mut SessionEntry> {
        self.sessions.values_mut().find(|entry| !entry.is_closed())
    }

    /// True when an open entry exists and carries a registration id,
    /// meaning the session completed a real handshake
    pub fn have_open_session(&self) -> bool {
        self.get_open_session()
            .map(|entry| entry.registration_id.is_some())
            .unwrap_or(false)
    }

    /// Record ids (base64 base keys) ordered most-recently-used first.
    ///
    /// This is the trial order for decrypting a normal message: an explicit
    /// sort on the `used` timestamp, not insertion order.
    pub fn session_ids_most_recent_first(&self) -> Vec<String> {
        let mut ids: Vec<(&String, DateTime<Utc>)> = self
            .sessions
            .iter()
            .map(|(id, entry)| (id, entry.index_info.used))
            .collect();
        ids.sort_by(|a, b| b.1.cmp(&a.1));
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Direct lookup by record id, bypassing the reflection guard (used by
    /// the decrypt trial loop, which iterates every candidate)
    pub fn session_by_id_mut(&mut self, id: &str) -> Option<&mut SessionEntry> {
        self.sessions.get_mut(id)
    }

    /// Number of entries currently held
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// True when the record holds no entries
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Prune to at most [`CLOSED_SESSIONS_MAX`] entries, always evicting
    /// the entry with the oldest closed-timestamp first.
    ///
    /// A record over the cap with nothing closed to evict is corrupt.
    pub fn remove_old_sessions(&mut self) -> Result<()> {
        while self.sessions.len() > CLOSED_SESSIONS_MAX {
            let oldest = self
                .sessions
                .iter()
                .filter_map(|(id, entry)| entry.index_info.closed.map(|ts| (id, ts)))
                .min_by_key(|(_, ts)| *ts)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    log::info!("Removing old closed session: {id}");
                    self.sessions.remove(&id);
                }
                None => {
                    return Err(SessionError::RecordCorrupt {
                        reason: "Over session cap with no closed entry to evict".to_string(),
                    }
                    .into())
                }
            }
        }
        Ok(())
    }

    /// Drop every entry, open or closed
    pub fn delete_all_sessions(&mut self) {
        self.sessions.clear();
    }

    /// Serialize to the persisted JSON document
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Into::into)
    }

    /// Load from the persisted JSON document, migrating older schemas
    pub fn from_json(json: &str) -> Result<Self> {
        let mut data: serde_json::Value = serde_json::from_str(json)?;
        let version = data.get("version").and_then(|v| v.as_str());
        if version != Some(SESSION_RECORD_VERSION) {
            Self::migrate(&mut data)?;
        }
        serde_json::from_value(data).map_err(Into::into)
    }

    /// Apply chained migrations starting from the document's declared
    /// version. No applicable step is a hard error.
    fn migrate(data: &mut serde_json::Value) -> Result<()> {
        if !data.is_object() {
            return Err(crate::utils::ProtocolError::Serialization(
                "Session record must be a JSON object".to_string(),
            ));
        }
        let declared = data
            .get("version")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let mut run = declared.is_none();
        for migration in MIGRATIONS {
            if run {
                log::info!("Migrating session record to: {}", migration.version);
                (migration.migrate)(data);
            } else if Some(migration.version) == declared.as_deref() {
                run = true;
            }
        }
        if !run {
            return Err(SessionError::Migration { version: declared }.into());
        }
        data["version"] = serde_json::Value::String(SESSION_RECORD_VERSION.to_string());
        Ok(())
    }
}

impl Default for SessionRecord {
    fn default() -> Self {
        Self::new()
    }
}

struct Migration {
    version: &'static str,
    migrate: fn(&mut serde_json::Value),
}

/// Ordered schema migrations; each step's `version` is the version it
/// produces.
const MIGRATIONS: &[Migration] = &[Migration {
    version: "v1",
    migrate: migrate_v1,
}];

/// v1 moved the registration id from the record onto each entry.
fn migrate_v1(data: &mut serde_json::Value) {
    let record_registration_id = data.get("registration_id").cloned();
    let Some(sessions) = data.get_mut("sessions").and_then(|s| s.as_object_mut()) else {
        return;
    };
    match record_registration_id {
        Some(id) if !id.is_null() => {
            for session in sessions.values_mut() {
                if session.get("registration_id").map_or(true, |v| v.is_null()) {
                    session["registration_id"] = id.clone();
                }
            }
        }
        _ => {
            for session in sessions.values() {
                let open = session
                    .pointer("/index_info/closed")
                    .map_or(false, |v| v.is_null());
                if open {
                    log::error!(
                        "v1 session migration: open session without a registration id"
                    );
                }
            }
        }
    }
}

/// Serde helpers encoding byte fields as base64 strings, keeping the
/// persisted document text-safe.
mod b64 {
    use super::*;
    use serde::de::Error as _;
    use serde::{Deserializer, Serializer};

    fn decode_arr32<E: serde::de::Error>(text: &str) -> std::result::Result<[u8; 32], E> {
        let bytes = BASE64.decode(text).map_err(E::custom)?;
        bytes
            .try_into()
            .map_err(|_| E::custom("expected 32 bytes of key material"))
    }

    pub mod arr32 {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &[u8; 32],
            serializer: S,
        ) -> std::result::Result<S::Ok, S::Error> {
            serializer.serialize_str(&BASE64.encode(value))
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> std::result::Result<[u8; 32], D::Error> {
            let text = String::deserialize(deserializer)?;
            decode_arr32(&text)
        }
    }

    pub mod opt_arr32 {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<[u8; 32]>,
            serializer: S,
        ) -> std::result::Result<S::Ok, S::Error> {
            match value {
                Some(bytes) => serializer.serialize_some(&BASE64.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> std::result::Result<Option<[u8; 32]>, D::Error> {
            let text: Option<String> = Option::deserialize(deserializer)?;
            text.map(|t| decode_arr32(&t)).transpose()
        }
    }

    pub mod message_keys {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &BTreeMap<u32, [u8; 32]>,
            serializer: S,
        ) -> std::result::Result<S::Ok, S::Error> {
            let encoded: BTreeMap<u32, String> = value
                .iter()
                .map(|(counter, key)| (*counter, BASE64.encode(key)))
                .collect();
            encoded.serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> std::result::Result<BTreeMap<u32, [u8; 32]>, D::Error> {
            let encoded: BTreeMap<u32, String> = BTreeMap::deserialize(deserializer)?;
            encoded
                .into_iter()
                .map(|(counter, text)| Ok((counter, decode_arr32(&text)?)))
                .collect()
        }
    }

    pub mod chain_map {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &BTreeMap<Vec<u8>, Chain>,
            serializer: S,
        ) -> std::result::Result<S::Ok, S::Error> {
            let encoded: BTreeMap<String, &Chain> = value
                .iter()
                .map(|(key, chain)| (BASE64.encode(key), chain))
                .collect();
            encoded.serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> std::result::Result<BTreeMap<Vec<u8>, Chain>, D::Error> {
            let encoded: BTreeMap<String, Chain> = BTreeMap::deserialize(deserializer)?;
            encoded
                .into_iter()
                .map(|(key, chain)| Ok((BASE64.decode(&key).map_err(D::Error::custom)?, chain)))
                .collect()
        }
    }

    pub mod key_pair {
        use super::*;

        #[derive(Serialize, Deserialize)]
        struct KeyPairData {
            pub_key: PublicKey,
            priv_key: String,
        }

        pub fn serialize<S: Serializer>(
            value: &KeyPair,
            serializer: S,
        ) -> std::result::Result<S::Ok, S::Error> {
            KeyPairData {
                pub_key: value.public,
                priv_key: BASE64.encode(value.private.to_bytes()),
            }
            .serialize(serializer)
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> std::result::Result<KeyPair, D::Error> {
            let data = KeyPairData::deserialize(deserializer)?;
            let bytes = BASE64.decode(&data.priv_key).map_err(D::Error::custom)?;
            let private = PrivateKey::from_bytes(&bytes).map_err(D::Error::custom)?;
            let pair = KeyPair::from_private(private);
            if pair.public != data.pub_key {
                return Err(D::Error::custom("key pair halves do not match"));
            }
            Ok(pair)
        }
    }
}
