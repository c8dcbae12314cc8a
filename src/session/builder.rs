//! Session establishment: the asymmetric handshake that seeds the ratchet.
//!
//! An initiator builds a session from the peer's published prekey bundle;
//! a responder builds one from the handshake message embedded in the first
//! ciphertext it receives. Both sides combine four key agreements into a
//! master secret, prefixed with 32 bytes of `0xFF`, and derive the initial
//! root key from it. The two sides feed the same agreements in a swapped
//! order so that the derived secrets line up.

use crate::crypto::{self, KeyPair, PublicKey, SIGNATURE_LENGTH};
use crate::session::record::{
    BaseKeyOrigin, Chain, ChainType, CurrentRatchet, IndexInfo, PendingPreKey, SessionEntry,
    SessionRecord,
};
use crate::session::{messages::PreKeyWhisperMessage, JobQueue, ProtocolAddress};
use crate::storage::ProtocolStore;
use crate::utils::{ProtocolConfig, ProtocolError, Result, SessionError};
use chrono::Utc;
use std::sync::Arc;

// Master secret prefix marking the DH-combination layout
const DISCONTINUITY_BYTES: [u8; 32] = [0xFF; 32];
const HANDSHAKE_INFO: &[u8] = b"WhisperText";
const RATCHET_INFO: &[u8] = b"WhisperRatchet";

/// A peer's published one-time prekey
#[derive(Debug, Clone)]
pub struct PublicPreKey {
    /// Identifier to echo back in the handshake message
    pub key_id: u32,
    /// The prekey itself
    pub public_key: PublicKey,
}

/// A peer's published signed prekey
#[derive(Debug, Clone)]
pub struct SignedPublicPreKey {
    /// Identifier to echo back in the handshake message
    pub key_id: u32,
    /// The prekey itself
    pub public_key: PublicKey,
    /// The peer identity key's XEdDSA signature over the encoded prekey
    pub signature: [u8; SIGNATURE_LENGTH],
}

/// Everything a peer publishes to allow sessions to be started with it
#[derive(Debug, Clone)]
pub struct PreKeyBundle {
    /// The peer's registration id
    pub registration_id: u32,
    /// The peer's long-term identity key
    pub identity_key: PublicKey,
    /// The peer's current signed prekey
    pub signed_pre_key: SignedPublicPreKey,
    /// A one-time prekey, when the peer still has some left
    pub pre_key: Option<PublicPreKey>,
}

/// Builds sessions toward one peer device
#[derive(Clone)]
pub struct SessionBuilder {
    store: Arc<dyn ProtocolStore>,
    address: ProtocolAddress,
    queue: Arc<JobQueue>,
    config: ProtocolConfig,
}

impl SessionBuilder {
    /// A builder for `address`, persisting through `store` and serializing
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

    /// Start a session as the initiator, from the peer's prekey bundle.
    ///
    /// Verifies the signed prekey's signature and the peer identity's
    /// trust before touching any state. Any previously open session for
    /// the address is closed, never overwritten.
    pub async fn init_outgoing(&self, bundle: &PreKeyBundle) -> Result<()> {
        let this = self.clone();
        let bundle = bundle.clone();
        self.queue
            .run(&self.address.to_string(), async move {
                this.init_outgoing_job(bundle).await
            })
            .await
    }

    async fn init_outgoing_job(self, bundle: PreKeyBundle) -> Result<()> {
        if !self
            .store
            .is_trusted_identity(&self.address, &bundle.identity_key)
            .await?
        {
            return Err(ProtocolError::UntrustedIdentity {
                address: self.address.to_string(),
                identity_key: bundle.identity_key.to_base64(),
            });
        }
        crypto::verify_signature(
            &bundle.identity_key,
            bundle.signed_pre_key.public_key.encode(),
            &bundle.signed_pre_key.signature,
        )?;

        let base_key = KeyPair::generate();
        let mut session = init_session(
            &self.store,
            true,
            Some(&base_key),
            None,
            &bundle.identity_key,
            bundle.pre_key.as_ref().map(|p| &p.public_key),
            Some(&bundle.signed_pre_key.public_key),
            Some(bundle.registration_id),
        )
        .await?;
        session.pending_pre_key = Some(PendingPreKey {
            base_key: base_key.public,
            signed_key_id: bundle.signed_pre_key.key_id,
            pre_key_id: bundle.pre_key.as_ref().map(|p| p.key_id),
        });

        let mut record = self
            .store
            .load_session(&self.address)
            .await?
            .unwrap_or_default();
        if let Some(open) = record.get_open_session_mut() {
            log::warn!("Closing stale open session for new outgoing prekey bundle");
            open.close();
        }
        record.set_session(session);
        self.store.store_session(&self.address, &record).await
    }

    /// Accept an incoming handshake message into `record`, as the
    /// responder.
    ///
    /// Runs unqueued: the caller is the decrypt path, which already holds
    /// the address's queue slot. A handshake whose base key already has a
    /// session is a resend and leaves the record untouched. Returns the
    /// one-time prekey id to delete once the embedded message decrypts.
    pub async fn init_incoming(
        &self,
        record: &mut SessionRecord,
        message: &PreKeyWhisperMessage,
    ) -> Result<Option<u32>> {
        let policy = self.config.legacy_key_policy;
        let their_identity = PublicKey::decode(&message.identity_key, policy)?;
        let base_key = PublicKey::decode(&message.base_key, policy)?;

        if !self
            .store
            .is_trusted_identity(&self.address, &their_identity)
            .await?
        {
            return Err(ProtocolError::UntrustedIdentity {
                address: self.address.to_string(),
                identity_key: their_identity.to_base64(),
            });
        }
        if record.get_session(&base_key)?.is_some() {
            log::info!("Duplicate handshake message for {}", self.address);
            return Ok(None);
        }

        let pre_key_pair = match message.pre_key_id {
            Some(id) => Some(
                self.store
                    .load_pre_key(id)
                    .await?
                    .ok_or(SessionError::InvalidPreKeyId)?,
            ),
            None => None,
        };
        let signed_pre_key_pair = self
            .store
            .load_signed_pre_key(message.signed_pre_key_id)
            .await?
            .ok_or(SessionError::MissingSignedPreKey)?;

        if let Some(open) = record.get_open_session_mut() {
            open.close();
        }
        let session = init_session(
            &self.store,
            false,
            pre_key_pair.as_ref(),
            Some(&signed_pre_key_pair),
            &their_identity,
            Some(&base_key),
            None,
            Some(message.registration_id),
        )
        .await?;
        record.set_session(session);
        Ok(message.pre_key_id)
    }
}

/// Derive a fresh session entry from the handshake key agreements.
///
/// The initiator signs agreements with its base key where the responder
/// uses its signed prekey; the swapped a1/a2 ordering makes both sides
/// arrive at the same master secret.
#[allow(clippy::too_many_arguments)]
async fn init_session(
    store: &Arc<dyn ProtocolStore>,
    is_initiator: bool,
    our_ephemeral_key: Option<&KeyPair>,
    our_signed_key: Option<&KeyPair>,
    their_identity_key: &PublicKey,
    their_ephemeral_key: Option<&PublicKey>,
    their_signed_key: Option<&PublicKey>,
    registration_id: Option<u32>,
) -> Result<SessionEntry> {
    let our_identity = store.get_our_identity().await?;

    let our_signed_key = if is_initiator {
        if our_signed_key.is_some() {
            return Err(SessionError::InvalidState {
                reason: "Initiator must not supply a signed key".to_string(),
            }
            .into());
        }
        our_ephemeral_key.ok_or(SessionError::InvalidState {
            reason: "Initiator requires a base key".to_string(),
        })?
    } else {
        our_signed_key.ok_or(SessionError::InvalidState {
            reason: "Responder requires its signed prekey".to_string(),
        })?
    };
    let their_signed_key = if is_initiator {
        their_signed_key.ok_or(SessionError::InvalidState {
            reason: "Initiator requires the peer's signed prekey".to_string(),
        })?
    } else {
        if their_signed_key.is_some() {
            return Err(SessionError::InvalidState {
                reason: "Responder must not supply the peer's signed key".to_string(),
            }
            .into());
        }
        their_ephemeral_key.ok_or(SessionError::InvalidState {
            reason: "Responder requires the peer's base key".to_string(),
        })?
    };

    let a1 = crypto::calculate_agreement(their_signed_key, &our_identity.private);
    let a2 = crypto::calculate_agreement(their_identity_key, &our_signed_key.private);
    let a3 = crypto::calculate_agreement(their_signed_key, &our_signed_key.private);

    let mut master = Vec::with_capacity(32 * 5);
    master.extend_from_slice(&DISCONTINUITY_BYTES);
    if is_initiator {
        master.extend_from_slice(&a1);
        master.extend_from_slice(&a2);
    } else {
        master.extend_from_slice(&a2);
        master.extend_from_slice(&a1);
    }
    master.extend_from_slice(&a3);
    if let (Some(ours), Some(theirs)) = (our_ephemeral_key, their_ephemeral_key) {
        master.extend_from_slice(&crypto::calculate_agreement(theirs, &ours.private));
    }

    let derived = crypto::derive_secrets(&master, &[0u8; 32], HANDSHAKE_INFO, 1)?;
    let root_key = derived[0];

    let now = Utc::now();
    let (base_key, base_key_origin) = if is_initiator {
        (our_signed_key.public, BaseKeyOrigin::Ours)
    } else {
        (*their_signed_key, BaseKeyOrigin::Theirs)
    };
    let ephemeral_key_pair = if is_initiator {
        KeyPair::generate()
    } else {
        our_signed_key.clone()
    };

    let mut session = SessionEntry::new(
        registration_id,
        CurrentRatchet {
            ephemeral_key_pair,
            last_remote_ephemeral_key: *their_signed_key,
            previous_counter: 0,
            root_key,
        },
        IndexInfo {
            base_key,
            base_key_origin,
            closed: None,
            used: now,
            created: now,
            remote_identity_key: *their_identity_key,
        },
    );
    if is_initiator {
        // The initiator can start sending immediately; the responder's
        // sending chain appears on its first reply's ratchet step.
        calculate_sending_ratchet(&mut session, their_signed_key)?;
    }
    Ok(session)
}

/// Advance the root key and install a sending chain keyed by our current
/// ratchet ephemeral.
fn calculate_sending_ratchet(session: &mut SessionEntry, remote_key: &PublicKey) -> Result<()> {
    let shared = crypto::calculate_agreement(
        remote_key,
        &session.current_ratchet.ephemeral_key_pair.private,
    );
    let derived = crypto::derive_secrets(
        &shared,
        &session.current_ratchet.root_key,
        RATCHET_INFO,
        2,
    )?;
    let our_ratchet_key = session.current_ratchet.ephemeral_key_pair.public;
    session.add_chain(&our_ratchet_key, Chain::new(derived[1], ChainType::Sending))?;
    session.current_ratchet.root_key = derived[0];
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    async fn bundle_for(store: &MemoryStore, with_pre_key: bool) -> PreKeyBundle {
        let identity = store.get_our_identity().await.unwrap();
        let signed = crypto::generate_signed_pre_key(&identity, 1);
        store.add_signed_pre_key(signed.clone());
        let pre_key = if with_pre_key {
            let pre_key = crypto::generate_pre_key(2);
            store.add_pre_key(pre_key.clone());
            Some(PublicPreKey {
                key_id: pre_key.key_id,
                public_key: pre_key.key_pair.public,
            })
        } else {
            None
        };
        PreKeyBundle {
            registration_id: store.get_our_registration_id().await.unwrap(),
            identity_key: identity.public,
            signed_pre_key: SignedPublicPreKey {
                key_id: signed.key_id,
                public_key: signed.key_pair.public,
                signature: signed.signature,
            },
            pre_key,
        }
    }

    fn builder_for(store: Arc<MemoryStore>, name: &str) -> SessionBuilder {
        SessionBuilder::new(
            store,
            ProtocolAddress::new(name, 1),
            JobQueue::new(),
            ProtocolConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_outgoing_session_is_open_and_pending() {
        let alice = Arc::new(MemoryStore::new());
        let bob = MemoryStore::new();
        let bundle = bundle_for(&bob, true).await;

        let builder = builder_for(Arc::clone(&alice), "bob");
        builder.init_outgoing(&bundle).await.unwrap();

        let record = alice
            .load_session(&ProtocolAddress::new("bob", 1))
            .await
            .unwrap()
            .unwrap();
        let session = record.get_open_session().unwrap();
        assert!(record.have_open_session());
        let pending = session.pending_pre_key.as_ref().unwrap();
        assert_eq!(pending.signed_key_id, 1);
        assert_eq!(pending.pre_key_id, Some(2));

        // The initiator gets its sending chain immediately
        let ratchet_key = session.current_ratchet.ephemeral_key_pair.public;
        let chain = session.chain(&ratchet_key).unwrap();
        assert_eq!(chain.chain_type, ChainType::Sending);
        assert_eq!(chain.chain_key.counter, -1);
    }

    #[tokio::test]
    async fn test_bad_signed_prekey_signature_is_rejected() {
        let alice = Arc::new(MemoryStore::new());
        let bob = MemoryStore::new();
        let mut bundle = bundle_for(&bob, true).await;
        bundle.signed_pre_key.signature[0] ^= 1;

        let builder = builder_for(Arc::clone(&alice), "bob");
        let err = builder.init_outgoing(&bundle).await.unwrap_err();
        assert!(err.is_security_violation());
        assert!(alice
            .load_session(&ProtocolAddress::new("bob", 1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_untrusted_identity_is_rejected() {
        let alice = Arc::new(MemoryStore::new());
        let bob = MemoryStore::new();
        let bundle = bundle_for(&bob, true).await;

        let bob_addr = ProtocolAddress::new("bob", 1);
        alice.set_trusted_identity(&bob_addr, KeyPair::generate().public);

        let builder = builder_for(Arc::clone(&alice), "bob");
        let err = builder.init_outgoing(&bundle).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UntrustedIdentity { .. }));
    }

    fn handshake_referencing(signed_pre_key_id: u32, pre_key_id: Option<u32>) -> PreKeyWhisperMessage {
        PreKeyWhisperMessage {
            registration_id: 7,
            identity_key: KeyPair::generate().public.encode().to_vec(),
            base_key: KeyPair::generate().public.encode().to_vec(),
            signed_pre_key_id,
            pre_key_id,
            message: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_incoming_with_unknown_one_time_prekey_id() {
        let bob = Arc::new(MemoryStore::new());
        let identity = bob.get_our_identity().await.unwrap();
        bob.add_signed_pre_key(crypto::generate_signed_pre_key(&identity, 1));

        let builder = builder_for(Arc::clone(&bob), "alice");
        let mut record = SessionRecord::new();
        let message = handshake_referencing(1, Some(9));
        let err = builder
            .init_incoming(&mut record, &message)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Session(SessionError::InvalidPreKeyId)
        ));
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn test_incoming_with_unknown_signed_prekey_id() {
        let bob = Arc::new(MemoryStore::new());

        let builder = builder_for(Arc::clone(&bob), "alice");
        let mut record = SessionRecord::new();
        let message = handshake_referencing(9, None);
        let err = builder
            .init_incoming(&mut record, &message)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Session(SessionError::MissingSignedPreKey)
        ));
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn test_new_outgoing_closes_previous_open_session() {
        let alice = Arc::new(MemoryStore::new());
        let bob = MemoryStore::new();
        let bundle = bundle_for(&bob, true).await;

        let builder = builder_for(Arc::clone(&alice), "bob");
        builder.init_outgoing(&bundle).await.unwrap();
        builder.init_outgoing(&bundle).await.unwrap();

        let record = alice
            .load_session(&ProtocolAddress::new("bob", 1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.len(), 2);
        assert!(record.have_open_session());
    }

    #[tokio::test]
    async fn test_handshake_roles_mirror_each_other() {
        let alice = Arc::new(MemoryStore::new());
        let bob = Arc::new(MemoryStore::new());

        let alice_identity = alice.get_our_identity().await.unwrap();
        let bob_identity = bob.get_our_identity().await.unwrap();
        let base_key = KeyPair::generate();
        let signed = crypto::generate_signed_pre_key(&bob_identity, 1);
        let one_time = crypto::generate_pre_key(2);

        let alice_store: Arc<dyn ProtocolStore> = alice;
        let bob_store: Arc<dyn ProtocolStore> = bob;
        let initiator = init_session(
            &alice_store,
            true,
            Some(&base_key),
            None,
            &bob_identity.public,
            Some(&one_time.key_pair.public),
            Some(&signed.key_pair.public),
            Some(1),
        )
        .await
        .unwrap();
        let responder = init_session(
            &bob_store,
            false,
            Some(&one_time.key_pair),
            Some(&signed.key_pair),
            &alice_identity.public,
            Some(&base_key.public),
            None,
            Some(2),
        )
        .await
        .unwrap();

        // Both entries are indexed by the same base key, with mirrored
        // origins; agreement of the derived secrets is exercised by the
        // ciphertext round-trip tests.
        assert_eq!(
            initiator.index_info.base_key,
            responder.index_info.base_key
        );
        assert_eq!(initiator.index_info.base_key_origin, BaseKeyOrigin::Ours);
        assert_eq!(responder.index_info.base_key_origin, BaseKeyOrigin::Theirs);
        assert_eq!(
            responder.current_ratchet.last_remote_ephemeral_key,
            base_key.public
        );
        assert_eq!(
            initiator.current_ratchet.last_remote_ephemeral_key,
            signed.key_pair.public
        );
        // The responder ratchets with its signed prekey until the first
        // reply; the initiator starts from a fresh ephemeral.
        assert_eq!(
            responder.current_ratchet.ephemeral_key_pair.public,
            signed.key_pair.public
        );
        assert_ne!(
            initiator.current_ratchet.ephemeral_key_pair.public,
            base_key.public
        );
    }
}
