//! Message encryption and decryption over established sessions.
//!
//! The cipher owns the Double Ratchet mechanics: every incoming ratchet
//! key that has not been seen before steps the root key and replaces the
//! sending chain; every message key is derived once, cached for
//! out-of-order arrival, and destroyed on use. All public operations run
//! through the per-address job queue, so concurrent calls against the
//! same peer serialize and the session record never sees two writers.

use crate::crypto::{self, KeyPair, PublicKey, IV_SIZE};
use crate::session::builder::SessionBuilder;
use crate::session::messages::{
    parse_version, version_byte, EnvelopeType, PreKeyWhisperMessage, WhisperMessage, MAC_LENGTH,
};
use crate::session::record::{Chain, ChainType, SessionEntry, SessionRecord};
use crate::session::{JobQueue, ProtocolAddress};
use crate::storage::ProtocolStore;
use crate::utils::{LegacyKeyPolicy, ProtocolConfig, ProtocolError, Result, SessionError};
use chrono::Utc;
use std::sync::Arc;
use zeroize::Zeroize;

/// How far past the chain head message keys may be derived in one jump
pub const MAX_SKIPPED_MESSAGE_KEYS: u32 = 2000;

const RATCHET_INFO: &[u8] = b"WhisperRatchet";
const MESSAGE_KEYS_INFO: &[u8] = b"WhisperMessageKeys";

/// An encrypted message ready for transport
#[derive(Debug, Clone)]
pub struct EncryptedMessage {
    /// Which envelope kind `body` contains
    pub envelope_type: EnvelopeType,
    /// The complete framed envelope
    pub body: Vec<u8>,
    /// The peer's registration id, when the session knows it
    pub registration_id: Option<u32>,
}

/// Encrypts and decrypts messages for one peer device
#[derive(Clone)]
pub struct SessionCipher {
    store: Arc<dyn ProtocolStore>,
    address: ProtocolAddress,
    queue: Arc<JobQueue>,
    config: ProtocolConfig,
}

impl SessionCipher {
    /// A cipher for `address`, persisting through `store` and serializing
    /// through `queue`
    pub fn new(
        store: Arc<dyn ProtocolStore>,
        address: ProtocolAddress,
        queue: Arc<JobQueue>,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            store,
            address,
            queue,
            config,
        }
    }

    /// Encrypt `plaintext` under the open session.
    ///
    /// While the session still awaits its first reply, the result is a
    /// prekey-bundle envelope that repeats the handshake; afterwards it is
    /// a plain ratchet envelope.
    pub async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedMessage> {
        let this = self.clone();
        let plaintext = plaintext.to_vec();
        self.queue
            .run(&self.address.to_string(), async move {
                this.encrypt_job(plaintext).await
            })
            .await
    }

    /// Decrypt a plain ratchet envelope, trying every stored session for
    /// the address, most recently used first.
    pub async fn decrypt_whisper_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let this = self.clone();
        let data = data.to_vec();
        self.queue
            .run(&self.address.to_string(), async move {
                this.decrypt_whisper_job(data).await
            })
            .await
    }

    /// Decrypt a prekey-bundle envelope, building the session first if its
    /// base key is new.
    pub async fn decrypt_prekey_whisper_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let this = self.clone();
        let data = data.to_vec();
        self.queue
            .run(&self.address.to_string(), async move {
                this.decrypt_prekey_job(data).await
            })
            .await
    }

    /// Whether a fully established, open session exists for the address
    pub async fn has_open_session(&self) -> Result<bool> {
        let this = self.clone();
        self.queue
            .run(&self.address.to_string(), async move {
                Ok(match this.store.load_session(&this.address).await? {
                    Some(record) => record.have_open_session(),
                    None => false,
                })
            })
            .await
    }

    /// Close the open session for the address, if any
    pub async fn close_open_session(&self) -> Result<()> {
        let this = self.clone();
        self.queue
            .run(&self.address.to_string(), async move {
                if let Some(mut record) = this.store.load_session(&this.address).await? {
                    let closed = match record.get_open_session_mut() {
                        Some(open) => {
                            open.close();
                            true
                        }
                        None => false,
                    };
                    if closed {
                        this.store.store_session(&this.address, &record).await?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// Remove every session, open or closed, for the address
    pub async fn delete_all_sessions(&self) -> Result<()> {
        let this = self.clone();
        self.queue
            .run(&self.address.to_string(), async move {
                if let Some(mut record) = this.store.load_session(&this.address).await? {
                    record.delete_all_sessions();
                    this.store.store_session(&this.address, &record).await?;
                }
                Ok(())
            })
            .await
    }

    async fn encrypt_job(self, plaintext: Vec<u8>) -> Result<EncryptedMessage> {
        let mut record = self
            .store
            .load_session(&self.address)
            .await?
            .ok_or(SessionError::NoSessionRecord)?;
        let our_identity = self.store.get_our_identity().await?;
        let our_registration_id = self.store.get_our_registration_id().await?;

        let remote_identity = record
            .get_open_session()
            .ok_or(SessionError::NoOpenSession)?
            .index_info
            .remote_identity_key;
        if !self
            .store
            .is_trusted_identity(&self.address, &remote_identity)
            .await?
        {
            return Err(ProtocolError::UntrustedIdentity {
                address: self.address.to_string(),
                identity_key: remote_identity.to_base64(),
            });
        }

        let message = {
            let session = record
                .get_open_session_mut()
                .ok_or(SessionError::NoOpenSession)?;
            let ratchet_key = session.current_ratchet.ephemeral_key_pair.public;
            let previous_counter = session.current_ratchet.previous_counter;
            let registration_id = session.registration_id;
            let pending = session.pending_pre_key.clone();

            let chain = session
                .chain_mut(&ratchet_key)
                .ok_or(SessionError::UnknownChain)?;
            if chain.chain_type != ChainType::Sending {
                return Err(SessionError::InvalidState {
                    reason: "Tried to encrypt on a receiving chain".to_string(),
                }
                .into());
            }
            let next_counter = (chain.chain_key.counter + 1) as u32;
            fill_message_keys(chain, next_counter)?;
            let counter = chain.chain_key.counter as u32;
            let mut key_material = chain
                .message_keys
                .remove(&counter)
                .ok_or(SessionError::MessageCounter)?;
            let keys =
                crypto::derive_secrets(&key_material, &[0u8; 32], MESSAGE_KEYS_INFO, 3)?;
            key_material.zeroize();

            let mut iv = [0u8; IV_SIZE];
            iv.copy_from_slice(&keys[2][..IV_SIZE]);
            let ciphertext = crypto::encrypt(&keys[0], &plaintext, &iv);
            let body = WhisperMessage {
                ephemeral_key: ratchet_key.encode().to_vec(),
                counter,
                previous_counter,
                ciphertext,
            }
            .to_bytes()?;

            // Sender identity first, receiver second
            let mut mac_input = Vec::with_capacity(67 + body.len());
            mac_input.extend_from_slice(our_identity.public.encode());
            mac_input.extend_from_slice(remote_identity.encode());
            mac_input.push(version_byte());
            mac_input.extend_from_slice(&body);
            let mac = crypto::calculate_mac(&keys[1], &mac_input);

            let mut envelope = Vec::with_capacity(1 + body.len() + MAC_LENGTH);
            envelope.push(version_byte());
            envelope.extend_from_slice(&body);
            envelope.extend_from_slice(&mac[..MAC_LENGTH]);

            match pending {
                Some(pending) => {
                    let handshake = PreKeyWhisperMessage {
                        registration_id: our_registration_id,
                        identity_key: our_identity.public.encode().to_vec(),
                        base_key: pending.base_key.encode().to_vec(),
                        signed_pre_key_id: pending.signed_key_id,
                        pre_key_id: pending.pre_key_id,
                        message: envelope,
                    }
                    .to_bytes()?;
                    let mut framed = Vec::with_capacity(1 + handshake.len());
                    framed.push(version_byte());
                    framed.extend_from_slice(&handshake);
                    EncryptedMessage {
                        envelope_type: EnvelopeType::PreKeyBundle,
                        body: framed,
                        registration_id,
                    }
                }
                None => EncryptedMessage {
                    envelope_type: EnvelopeType::Whisper,
                    body: envelope,
                    registration_id,
                },
            }
        };

        record.remove_old_sessions()?;
        self.store.store_session(&self.address, &record).await?;
        Ok(message)
    }

    async fn decrypt_whisper_job(self, data: Vec<u8>) -> Result<Vec<u8>> {
        let mut record = self
            .store
            .load_session(&self.address)
            .await?
            .ok_or(SessionError::NoSessionRecord)?;
        let our_identity = self.store.get_our_identity().await?;

        let mut attempts: Vec<(String, String)> = Vec::new();
        let mut decrypted: Option<(Vec<u8>, PublicKey, bool)> = None;
        for id in record.session_ids_most_recent_first() {
            let Some(session) = record.session_by_id_mut(&id) else {
                continue;
            };
            match do_decrypt(
                session,
                &data,
                &our_identity.public,
                self.config.legacy_key_policy,
            ) {
                Ok(plaintext) => {
                    session.index_info.used = Utc::now();
                    decrypted = Some((
                        plaintext,
                        session.index_info.remote_identity_key,
                        session.is_closed(),
                    ));
                    break;
                }
                Err(err) => attempts.push((id, err.to_string())),
            }
        }
        let Some((plaintext, remote_identity, was_closed)) = decrypted else {
            log::error!(
                "Failed to decrypt message with any known session ({} tried)",
                attempts.len()
            );
            return Err(SessionError::NoMatchingSession { attempts }.into());
        };

        // Trust is checked before anything is persisted
        if !self
            .store
            .is_trusted_identity(&self.address, &remote_identity)
            .await?
        {
            return Err(ProtocolError::UntrustedIdentity {
                address: self.address.to_string(),
                identity_key: remote_identity.to_base64(),
            });
        }
        if was_closed {
            log::warn!("Decrypted a message with a closed session");
        }

        record.remove_old_sessions()?;
        self.store.store_session(&self.address, &record).await?;
        Ok(plaintext)
    }

    async fn decrypt_prekey_job(self, data: Vec<u8>) -> Result<Vec<u8>> {
        let first = *data
            .first()
            .ok_or_else(|| ProtocolError::Serialization("Empty message".to_string()))?;
        parse_version(first)?;
        let message = PreKeyWhisperMessage::from_bytes(&data[1..])?;

        let mut record = match self.store.load_session(&self.address).await? {
            Some(record) => record,
            None => {
                if message.registration_id == 0 {
                    return Err(SessionError::MissingRegistrationId.into());
                }
                SessionRecord::new()
            }
        };

        let builder = SessionBuilder::new(
            Arc::clone(&self.store),
            self.address.clone(),
            Arc::clone(&self.queue),
            self.config,
        );
        let pre_key_id = builder.init_incoming(&mut record, &message).await?;

        let base_key = PublicKey::decode(&message.base_key, self.config.legacy_key_policy)?;
        let our_identity = self.store.get_our_identity().await?;
        let plaintext = {
            let session = record
                .get_session_mut(&base_key)?
                .ok_or_else(|| ProtocolError::unexpected("Handshake produced no session"))?;
            let plaintext = do_decrypt(
                session,
                &message.message,
                &our_identity.public,
                self.config.legacy_key_policy,
            )?;
            session.index_info.used = Utc::now();
            plaintext
        };

        record.remove_old_sessions()?;
        self.store.store_session(&self.address, &record).await?;
        if let Some(id) = pre_key_id {
            self.store.remove_pre_key(id).await?;
        }
        Ok(plaintext)
    }
}

/// Decrypt one ratchet envelope against one session entry.
///
/// Mutates the entry (ratchet steps, key consumption) even when it later
/// fails; callers only persist the record after an overall success.
fn do_decrypt(
    session: &mut SessionEntry,
    data: &[u8],
    our_identity: &PublicKey,
    policy: LegacyKeyPolicy,
) -> Result<Vec<u8>> {
    if data.len() < 2 + MAC_LENGTH {
        return Err(ProtocolError::Serialization(
            "Ratchet message too short".to_string(),
        ));
    }
    parse_version(data[0])?;
    let body = &data[1..data.len() - MAC_LENGTH];
    let their_mac = &data[data.len() - MAC_LENGTH..];
    let message = WhisperMessage::from_bytes(body)?;
    let ephemeral = PublicKey::decode(&message.ephemeral_key, policy)?;

    maybe_step_ratchet(session, &ephemeral, message.previous_counter)?;
    let remote_identity = session.index_info.remote_identity_key;
    let chain = session
        .chain_mut(&ephemeral)
        .ok_or(SessionError::UnknownChain)?;
    if chain.chain_type != ChainType::Receiving {
        return Err(SessionError::InvalidState {
            reason: "Tried to decrypt on a sending chain".to_string(),
        }
        .into());
    }
    fill_message_keys(chain, message.counter)?;
    let mut key_material = chain
        .message_keys
        .remove(&message.counter)
        .ok_or(SessionError::MessageCounter)?;
    let keys = crypto::derive_secrets(&key_material, &[0u8; 32], MESSAGE_KEYS_INFO, 3)?;
    key_material.zeroize();

    // Sender identity first: the mirror of the encrypt-side MAC input
    let mut mac_input = Vec::with_capacity(67 + body.len());
    mac_input.extend_from_slice(remote_identity.encode());
    mac_input.extend_from_slice(our_identity.encode());
    mac_input.push(data[0]);
    mac_input.extend_from_slice(body);
    crypto::verify_mac(&mac_input, &keys[1], their_mac, MAC_LENGTH)?;

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&keys[2][..IV_SIZE]);
    let plaintext = crypto::decrypt(&keys[0], &message.ciphertext, &iv)?;

    // First authenticated round trip confirms the session
    session.pending_pre_key = None;
    Ok(plaintext)
}

/// Step the ratchet if `remote_key` has not been seen on this session yet.
///
/// Fills the old receiving chain up to the sender's `previous_counter` so
/// that stragglers from it stay decryptable, closes it, installs the new
/// receiving chain, then replaces our sending chain under a fresh
/// ephemeral.
fn maybe_step_ratchet(
    session: &mut SessionEntry,
    remote_key: &PublicKey,
    previous_counter: u32,
) -> Result<()> {
    if session.chain(remote_key).is_some() {
        return Ok(());
    }
    log::debug!("New remote ephemeral key, stepping the ratchet");

    let last_remote = session.current_ratchet.last_remote_ephemeral_key;
    if let Some(previous_chain) = session.chain_mut(&last_remote) {
        fill_message_keys(previous_chain, previous_counter)?;
        // Closed, but its cached message keys stay available
        previous_chain.chain_key.key = None;
    }
    calculate_ratchet(session, remote_key, false)?;

    let our_ratchet_key = session.current_ratchet.ephemeral_key_pair.public;
    let sending_counter = session
        .chain(&our_ratchet_key)
        .map(|chain| chain.chain_key.counter);
    if let Some(counter) = sending_counter {
        session.current_ratchet.previous_counter = counter.max(0) as u32;
        session.delete_chain(&our_ratchet_key)?;
    }
    session.current_ratchet.ephemeral_key_pair = KeyPair::generate();
    calculate_ratchet(session, remote_key, true)?;
    session.current_ratchet.last_remote_ephemeral_key = *remote_key;
    Ok(())
}

/// Advance the root key and install a chain for one direction
fn calculate_ratchet(
    session: &mut SessionEntry,
    remote_key: &PublicKey,
    sending: bool,
) -> Result<()> {
    let shared = crypto::calculate_agreement(
        remote_key,
        &session.current_ratchet.ephemeral_key_pair.private,
    );
    let derived =
        crypto::derive_secrets(&shared, &session.current_ratchet.root_key, RATCHET_INFO, 2)?;
    let (chain_owner, chain_type) = if sending {
        (
            session.current_ratchet.ephemeral_key_pair.public,
            ChainType::Sending,
        )
    } else {
        (*remote_key, ChainType::Receiving)
    };
    session.add_chain(&chain_owner, Chain::new(derived[1], chain_type))?;
    session.current_ratchet.root_key = derived[0];
    Ok(())
}

/// Advance `chain` until its head has produced the key for `counter`.
///
/// Every intermediate key is cached for out-of-order arrival. The jump is
/// bounded before any key is derived, and a closed chain cannot advance.
fn fill_message_keys(chain: &mut Chain, counter: u32) -> Result<()> {
    let target = i64::from(counter);
    if i64::from(chain.chain_key.counter) >= target {
        return Ok(());
    }
    let jump = target - i64::from(chain.chain_key.counter);
    if jump > i64::from(MAX_SKIPPED_MESSAGE_KEYS) {
        return Err(SessionError::CounterTooFarAhead {
            max: MAX_SKIPPED_MESSAGE_KEYS,
            jump: u32::try_from(jump).unwrap_or(u32::MAX),
        }
        .into());
    }
    let mut key = chain.chain_key.key.ok_or(SessionError::ChainClosed)?;
    while i64::from(chain.chain_key.counter) < target {
        let next = (chain.chain_key.counter + 1) as u32;
        chain.message_keys.insert(next, crypto::calculate_mac(&key, &[1]));
        key = crypto::calculate_mac(&key, &[2]);
        chain.chain_key.counter = next as i32;
    }
    chain.chain_key.key = Some(key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::builder::{PreKeyBundle, PublicPreKey, SignedPublicPreKey};
    use crate::session::record::ChainKey;
    use crate::storage::MemoryStore;

    struct Pair {
        alice_store: Arc<MemoryStore>,
        bob_store: Arc<MemoryStore>,
        alice: SessionCipher,
        bob: SessionCipher,
    }

    /// Alice initiates toward Bob's published bundle; Bob will learn of
    /// the session from her first message.
    async fn establish() -> Pair {
        let _ = env_logger::builder().is_test(true).try_init();
        let alice_store = Arc::new(MemoryStore::new());
        let bob_store = Arc::new(MemoryStore::new());
        let config = ProtocolConfig::default();

        let bob_identity = bob_store.get_our_identity().await.unwrap();
        let signed = crypto::generate_signed_pre_key(&bob_identity, 1);
        bob_store.add_signed_pre_key(signed.clone());
        let pre_key = crypto::generate_pre_key(2);
        bob_store.add_pre_key(pre_key.clone());

        let bundle = PreKeyBundle {
            registration_id: bob_store.get_our_registration_id().await.unwrap(),
            identity_key: bob_identity.public,
            signed_pre_key: SignedPublicPreKey {
                key_id: signed.key_id,
                public_key: signed.key_pair.public,
                signature: signed.signature,
            },
            pre_key: Some(PublicPreKey {
                key_id: pre_key.key_id,
                public_key: pre_key.key_pair.public,
            }),
        };

        let bob_addr = ProtocolAddress::new("bob", 1);
        let alice_addr = ProtocolAddress::new("alice", 1);
        let alice_queue = JobQueue::new();
        let bob_queue = JobQueue::new();

        let builder = SessionBuilder::new(
            alice_store.clone() as Arc<dyn ProtocolStore>,
            bob_addr.clone(),
            Arc::clone(&alice_queue),
            config,
        );
        builder.init_outgoing(&bundle).await.unwrap();

        Pair {
            alice: SessionCipher::new(
                alice_store.clone() as Arc<dyn ProtocolStore>,
                bob_addr,
                alice_queue,
                config,
            ),
            bob: SessionCipher::new(
                bob_store.clone() as Arc<dyn ProtocolStore>,
                alice_addr,
                bob_queue,
                config,
            ),
            alice_store,
            bob_store,
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let pair = establish().await;

        let message = pair.alice.encrypt(b"hello").await.unwrap();
        assert_eq!(message.envelope_type, EnvelopeType::PreKeyBundle);

        let plaintext = pair
            .bob
            .decrypt_prekey_whisper_message(&message.body)
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello");

        // Bob's reply is a plain envelope and confirms Alice's session
        let reply = pair.bob.encrypt(b"hi yourself").await.unwrap();
        assert_eq!(reply.envelope_type, EnvelopeType::Whisper);
        let plaintext = pair
            .alice
            .decrypt_whisper_message(&reply.body)
            .await
            .unwrap();
        assert_eq!(plaintext, b"hi yourself");

        // Confirmed: Alice stops sending the handshake frame
        let message = pair.alice.encrypt(b"again").await.unwrap();
        assert_eq!(message.envelope_type, EnvelopeType::Whisper);
        let plaintext = pair
            .bob
            .decrypt_whisper_message(&message.body)
            .await
            .unwrap();
        assert_eq!(plaintext, b"again");
    }

    #[tokio::test]
    async fn test_conversation_across_ratchet_steps() {
        let pair = establish().await;

        for round in 0..4u32 {
            let text = format!("alice round {round}");
            let message = pair.alice.encrypt(text.as_bytes()).await.unwrap();
            let plaintext = match message.envelope_type {
                EnvelopeType::PreKeyBundle => pair
                    .bob
                    .decrypt_prekey_whisper_message(&message.body)
                    .await
                    .unwrap(),
                EnvelopeType::Whisper => pair
                    .bob
                    .decrypt_whisper_message(&message.body)
                    .await
                    .unwrap(),
            };
            assert_eq!(plaintext, text.as_bytes());

            let text = format!("bob round {round}");
            let reply = pair.bob.encrypt(text.as_bytes()).await.unwrap();
            let plaintext = pair
                .alice
                .decrypt_whisper_message(&reply.body)
                .await
                .unwrap();
            assert_eq!(plaintext, text.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_out_of_order_delivery_and_replay() {
        let pair = establish().await;

        let m0 = pair.alice.encrypt(b"zero").await.unwrap();
        let m1 = pair.alice.encrypt(b"one").await.unwrap();
        let m2 = pair.alice.encrypt(b"two").await.unwrap();

        // Delivery order 2, 0, 1: skipped keys must be cached
        assert_eq!(
            pair.bob
                .decrypt_prekey_whisper_message(&m2.body)
                .await
                .unwrap(),
            b"two"
        );
        assert_eq!(
            pair.bob
                .decrypt_prekey_whisper_message(&m0.body)
                .await
                .unwrap(),
            b"zero"
        );
        assert_eq!(
            pair.bob
                .decrypt_prekey_whisper_message(&m1.body)
                .await
                .unwrap(),
            b"one"
        );

        // Replay: the message key is gone
        let err = pair
            .bob
            .decrypt_prekey_whisper_message(&m1.body)
            .await
            .unwrap_err();
        assert!(err.is_security_violation(), "{err}");
    }

    #[tokio::test]
    async fn test_tampered_mac_is_rejected() {
        let pair = establish().await;

        let message = pair.alice.encrypt(b"hello").await.unwrap();
        pair.bob
            .decrypt_prekey_whisper_message(&message.body)
            .await
            .unwrap();
        let reply = pair.bob.encrypt(b"reply").await.unwrap();

        let mut tampered = reply.body.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;
        let err = pair
            .alice
            .decrypt_whisper_message(&tampered)
            .await
            .unwrap_err();
        // Reported as trial exhaustion; the MAC failure is in the attempts
        assert!(err.to_string().contains("No matching session"), "{err}");

        // The untouched envelope still decrypts
        assert_eq!(
            pair.alice.decrypt_whisper_message(&reply.body).await.unwrap(),
            b"reply"
        );
    }

    #[tokio::test]
    async fn test_incompatible_version_is_rejected() {
        let pair = establish().await;
        let message = pair.alice.encrypt(b"hello").await.unwrap();

        let mut wrong = message.body.clone();
        wrong[0] = 0x22;
        let err = pair
            .bob
            .decrypt_prekey_whisper_message(&wrong)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("version"), "{err}");
    }

    #[tokio::test]
    async fn test_handshake_resend_is_idempotent() {
        let pair = establish().await;

        let m0 = pair.alice.encrypt(b"first").await.unwrap();
        assert_eq!(
            pair.bob
                .decrypt_prekey_whisper_message(&m0.body)
                .await
                .unwrap(),
            b"first"
        );

        // Until Alice sees a reply, she keeps resending the handshake;
        // Bob must not build a second session for the same base key
        let m1 = pair.alice.encrypt(b"second").await.unwrap();
        assert_eq!(m1.envelope_type, EnvelopeType::PreKeyBundle);
        assert_eq!(
            pair.bob
                .decrypt_prekey_whisper_message(&m1.body)
                .await
                .unwrap(),
            b"second"
        );

        let record = pair
            .bob_store
            .load_session(&ProtocolAddress::new("alice", 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.len(), 1);
    }

    #[tokio::test]
    async fn test_one_time_prekey_is_consumed() {
        let pair = establish().await;
        let message = pair.alice.encrypt(b"hello").await.unwrap();
        pair.bob
            .decrypt_prekey_whisper_message(&message.body)
            .await
            .unwrap();

        assert!(pair.bob_store.load_pre_key(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_untrusted_identity_blocks_encrypt() {
        let pair = establish().await;
        pair.alice.encrypt(b"warmup").await.unwrap();

        let bob_addr = ProtocolAddress::new("bob", 1);
        let before = pair
            .alice_store
            .load_session(&bob_addr)
            .await
            .unwrap()
            .unwrap()
            .to_json()
            .unwrap();

        // Re-pin Bob's address to a different identity key
        pair.alice_store
            .set_trusted_identity(&bob_addr, KeyPair::generate().public);
        let err = pair.alice.encrypt(b"hello").await.unwrap_err();
        assert!(matches!(err, ProtocolError::UntrustedIdentity { .. }));

        // The refused operation must not have advanced any state
        let after = pair
            .alice_store
            .load_session(&bob_addr)
            .await
            .unwrap()
            .unwrap()
            .to_json()
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_ratchet_step_replaces_chains_and_root() {
        let pair = establish().await;
        let bob_addr = ProtocolAddress::new("bob", 1);

        // Two messages on Alice's first sending chain (counters 0 and 1)
        let m0 = pair.alice.encrypt(b"zero").await.unwrap();
        let m1 = pair.alice.encrypt(b"one").await.unwrap();
        pair.bob
            .decrypt_prekey_whisper_message(&m0.body)
            .await
            .unwrap();
        pair.bob
            .decrypt_prekey_whisper_message(&m1.body)
            .await
            .unwrap();

        let before = pair
            .alice_store
            .load_session(&bob_addr)
            .await
            .unwrap()
            .unwrap();
        let entry = before.get_open_session().unwrap();
        let old_root = entry.current_ratchet.root_key;
        let old_ratchet_key = entry.current_ratchet.ephemeral_key_pair.public;

        // Bob's reply carries a new remote ephemeral: Alice must step
        let reply = pair.bob.encrypt(b"reply").await.unwrap();
        pair.alice
            .decrypt_whisper_message(&reply.body)
            .await
            .unwrap();

        let after = pair
            .alice_store
            .load_session(&bob_addr)
            .await
            .unwrap()
            .unwrap();
        let entry = after.get_open_session().unwrap();
        assert_ne!(entry.current_ratchet.root_key, old_root);
        assert_ne!(
            entry.current_ratchet.ephemeral_key_pair.public,
            old_ratchet_key
        );
        // The final counter of the retired sending chain is recorded, and
        // the chain itself is gone
        assert_eq!(entry.current_ratchet.previous_counter, 1);
        assert!(entry.chain(&old_ratchet_key).is_none());
        // A fresh sending chain is ready
        let chain = entry
            .chain(&entry.current_ratchet.ephemeral_key_pair.public)
            .unwrap();
        assert_eq!(chain.chain_type, ChainType::Sending);
        assert_eq!(chain.chain_key.counter, -1);
    }

    #[tokio::test]
    async fn test_concurrent_encrypts_serialize_in_submission_order() {
        let pair = establish().await;

        // Confirm the session first so envelopes are plain ratchet frames
        let m = pair.alice.encrypt(b"hello").await.unwrap();
        pair.bob
            .decrypt_prekey_whisper_message(&m.body)
            .await
            .unwrap();
        let reply = pair.bob.encrypt(b"hi").await.unwrap();
        pair.alice
            .decrypt_whisper_message(&reply.body)
            .await
            .unwrap();

        let texts: Vec<Vec<u8>> = (0..5u32).map(|i| format!("msg {i}").into_bytes()).collect();
        let pending: Vec<_> = texts.iter().map(|text| pair.alice.encrypt(text)).collect();
        let messages = futures::future::join_all(pending).await;

        for (i, message) in messages.into_iter().enumerate() {
            let message = message.unwrap();
            assert_eq!(message.envelope_type, EnvelopeType::Whisper);
            let body = &message.body[1..message.body.len() - MAC_LENGTH];
            let parsed = WhisperMessage::from_bytes(body).unwrap();
            // The post-step sending chain starts at 0; submission order
            // is counter order
            assert_eq!(parsed.counter, i as u32);
        }
    }

    #[tokio::test]
    async fn test_open_session_lifecycle() {
        let pair = establish().await;

        // Alice's side is open immediately; Bob has nothing yet
        assert!(pair.alice.has_open_session().await.unwrap());
        assert!(!pair.bob.has_open_session().await.unwrap());

        let message = pair.alice.encrypt(b"hello").await.unwrap();
        pair.bob
            .decrypt_prekey_whisper_message(&message.body)
            .await
            .unwrap();
        assert!(pair.bob.has_open_session().await.unwrap());

        pair.bob.close_open_session().await.unwrap();
        assert!(!pair.bob.has_open_session().await.unwrap());

        pair.bob.delete_all_sessions().await.unwrap();
        let record = pair
            .bob_store
            .load_session(&ProtocolAddress::new("alice", 1))
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn test_encrypt_without_session_fails() {
        let store = Arc::new(MemoryStore::new()) as Arc<dyn ProtocolStore>;
        let cipher = SessionCipher::new(
            store,
            ProtocolAddress::new("nobody", 1),
            JobQueue::new(),
            ProtocolConfig::default(),
        );
        let err = cipher.encrypt(b"hello").await.unwrap_err();
        assert!(err.to_string().contains("No session record"), "{err}");
        assert!(!cipher.has_open_session().await.unwrap());
    }

    #[test]
    fn test_fill_message_keys_ladder() {
        let mut chain = Chain::new([3u8; 32], ChainType::Receiving);
        fill_message_keys(&mut chain, 4).unwrap();

        assert_eq!(chain.chain_key.counter, 4);
        // Keys 0..=4 derived, each distinct
        let keys: Vec<_> = chain.message_keys.values().collect();
        assert_eq!(keys.len(), 5);
        for window in keys.windows(2) {
            assert_ne!(window[0], window[1]);
        }

        // Refilling to a lower counter is a no-op
        fill_message_keys(&mut chain, 2).unwrap();
        assert_eq!(chain.chain_key.counter, 4);
    }

    #[test]
    fn test_fill_message_keys_bounds_the_jump() {
        let mut chain = Chain::new([3u8; 32], ChainType::Receiving);
        let err = fill_message_keys(&mut chain, MAX_SKIPPED_MESSAGE_KEYS + 1).unwrap_err();
        assert!(err.to_string().contains("into the future"), "{err}");
        // Nothing was derived
        assert!(chain.message_keys.is_empty());
        assert_eq!(chain.chain_key.counter, -1);
    }

    #[test]
    fn test_fill_message_keys_on_closed_chain() {
        let mut chain = Chain {
            chain_key: ChainKey {
                counter: 3,
                key: None,
            },
            chain_type: ChainType::Receiving,
            message_keys: Default::default(),
        };
        let err = fill_message_keys(&mut chain, 5).unwrap_err();
        assert!(err.to_string().contains("Chain closed"), "{err}");
        // Already-derived counters are still reachable
        fill_message_keys(&mut chain, 3).unwrap();
    }
}
