//! Session establishment, message ciphering, and session persistence.
//!
//! This module is the protocol core: `builder` runs the handshake,
//! `cipher` runs the ratchet, `record` holds the persistent multi-session
//! state, and `queue` serializes all of it per peer address.

pub mod address;
pub mod builder;
pub mod cipher;
pub mod messages;
pub mod queue;
pub mod record;

pub use address::ProtocolAddress;
pub use builder::{PreKeyBundle, PublicPreKey, SessionBuilder, SignedPublicPreKey};
pub use cipher::{EncryptedMessage, SessionCipher, MAX_SKIPPED_MESSAGE_KEYS};
pub use messages::{EnvelopeType, PreKeyWhisperMessage, WhisperMessage, CIPHERTEXT_VERSION};
pub use queue::JobQueue;
pub use record::{SessionEntry, SessionRecord, CLOSED_SESSIONS_MAX};
