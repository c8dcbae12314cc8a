//! Wire formats for ratchet and handshake messages.
//!
//! Every envelope starts with a version byte carrying the protocol version
//! in both nibbles. A normal ratchet message follows with its serialized
//! body and a truncated HMAC over both identities, the version byte, and
//! the body. A handshake message wraps a complete ratchet envelope together
//! with the prekey references the receiver needs to build the session.
//!
//! Key fields travel as raw bytes and are decoded by the session layer,
//! where the legacy-key policy applies.

use crate::utils::{Result, SessionError};
use serde::{Deserialize, Serialize};

/// The protocol version spoken and required
pub const CIPHERTEXT_VERSION: u8 = 3;

/// Length in bytes of the truncated envelope MAC
pub const MAC_LENGTH: usize = 8;

/// Discriminates the two envelope kinds handed to transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeType {
    /// A normal ratchet message for an established session
    Whisper = 1,
    /// A handshake message carrying prekey references plus a ratchet message
    PreKeyBundle = 3,
}

/// The version byte placed at the front of every envelope
pub fn version_byte() -> u8 {
    (CIPHERTEXT_VERSION << 4) | CIPHERTEXT_VERSION
}

/// Extract and check the version from an envelope's first byte.
///
/// The high nibble is the highest version the sender supports, the low
/// nibble the version this message is written in. The message must be in
/// a version we speak, from a sender able to speak ours.
pub fn parse_version(byte: u8) -> Result<u8> {
    let max_version = byte >> 4;
    let current_version = byte & 0x0F;
    if current_version > CIPHERTEXT_VERSION || max_version < CIPHERTEXT_VERSION {
        return Err(SessionError::IncompatibleVersion {
            max_version,
            current_version,
        }
        .into());
    }
    Ok(current_version)
}

/// Body of a normal ratchet message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperMessage {
    /// Sender's current ratchet key, tagged 33-byte encoding
    pub ephemeral_key: Vec<u8>,
    /// Counter of the message key within the sending chain
    pub counter: u32,
    /// Final counter of the sender's previous sending chain
    pub previous_counter: u32,
    /// AES-256-CBC ciphertext of the plaintext
    pub ciphertext: Vec<u8>,
}

impl WhisperMessage {
    /// Serialize the body for framing
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Into::into)
    }

    /// Parse a body out of a framed envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Into::into)
    }
}

/// Body of a handshake message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreKeyWhisperMessage {
    /// Sender's registration id
    pub registration_id: u32,
    /// Sender's long-term identity key, tagged encoding
    pub identity_key: Vec<u8>,
    /// Sender's handshake base key, tagged encoding
    pub base_key: Vec<u8>,
    /// Id of the receiver's signed prekey used in the handshake
    pub signed_pre_key_id: u32,
    /// Id of the receiver's one-time prekey, if one was used
    pub pre_key_id: Option<u32>,
    /// A complete normal envelope, encrypted under the new session
    pub message: Vec<u8>,
}

impl PreKeyWhisperMessage {
    /// Serialize the body for framing
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(Into::into)
    }

    /// Parse a body out of a framed envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(Into::into)
    }
}
