//! Curve25519 key agreement and signatures.
//!
//! Public keys travel in a 33-byte encoding: a 1-byte format tag (`0x05`)
//! followed by the 32-byte curve point. A bare 32-byte form exists in the
//! wild from older clients; whether it is accepted is an explicit
//! [`LegacyKeyPolicy`] choice, never silent. Signatures are XEdDSA, so the
//! same Curve25519 identity key both agrees and signs.

use crate::utils::{CryptoError, LegacyKeyPolicy, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::StaticSecret;
use xeddsa::xed25519;
use xeddsa::{Sign, Verify};

/// Format tag carried by every encoded public key
pub const KEY_TYPE_TAG: u8 = 0x05;

/// Length of an encoded public key (tag + point)
pub const PUBLIC_KEY_LENGTH: usize = 33;

/// Length of a private key
pub const PRIVATE_KEY_LENGTH: usize = 32;

/// Length of an XEdDSA signature
pub const SIGNATURE_LENGTH: usize = 64;

/// A Curve25519 public key, held in its tagged 33-byte encoding
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey([u8; PUBLIC_KEY_LENGTH]);

impl PublicKey {
    /// Decode a public key from its wire form.
    ///
    /// Accepts the tagged 33-byte encoding unconditionally. The bare
    /// 32-byte form is accepted only under [`LegacyKeyPolicy::Warn`], and
    /// every acceptance is logged.
    pub fn decode(bytes: &[u8], policy: LegacyKeyPolicy) -> Result<Self> {
        match bytes.len() {
            PUBLIC_KEY_LENGTH if bytes[0] == KEY_TYPE_TAG => {
                let mut encoded = [0u8; PUBLIC_KEY_LENGTH];
                encoded.copy_from_slice(bytes);
                Ok(Self(encoded))
            }
            32 => match policy {
                LegacyKeyPolicy::Warn => {
                    log::warn!(
                        "Accepting legacy untagged 32-byte public key; \
                         the sending client should be upgraded"
                    );
                    let mut encoded = [0u8; PUBLIC_KEY_LENGTH];
                    encoded[0] = KEY_TYPE_TAG;
                    encoded[1..].copy_from_slice(bytes);
                    Ok(Self(encoded))
                }
                LegacyKeyPolicy::Reject => Err(CryptoError::InvalidKey {
                    reason: "Untagged 32-byte public key rejected by policy".to_string(),
                }
                .into()),
            },
            other => Err(CryptoError::InvalidKey {
                reason: format!("Invalid public key length: {other}"),
            }
            .into()),
        }
    }

    /// The full 33-byte tagged encoding
    pub fn encode(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.0
    }

    /// The raw 32-byte curve point, without the format tag
    pub fn point(&self) -> [u8; 32] {
        let mut point = [0u8; 32];
        point.copy_from_slice(&self.0[1..]);
        point
    }

    /// Base64 of the tagged encoding, used for map keys and diagnostics
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(private: &StaticSecret) -> Self {
        let point = x25519_dalek::PublicKey::from(private);
        let mut encoded = [0u8; PUBLIC_KEY_LENGTH];
        encoded[0] = KEY_TYPE_TAG;
        encoded[1..].copy_from_slice(point.as_bytes());
        Self(encoded)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base64())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(&text).map_err(serde::de::Error::custom)?;
        PublicKey::decode(&bytes, LegacyKeyPolicy::Reject).map_err(serde::de::Error::custom)
    }
}

/// A Curve25519 private key
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    /// Generate a fresh random private key
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    /// Reconstruct a private key from its 32 raw bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let array: [u8; PRIVATE_KEY_LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!("Incorrect private key length: {}", bytes.len()),
            })?;
        Ok(Self(StaticSecret::from(array)))
    }

    /// The raw 32 key bytes, for persistence
    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        self.0.to_bytes()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

/// A Curve25519 key pair
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// Tagged public half
    pub public: PublicKey,
    /// Private half
    pub private: PrivateKey,
}

impl KeyPair {
    /// Generate a fresh random key pair
    pub fn generate() -> Self {
        let private = PrivateKey::generate();
        let public = PublicKey::from(&private.0);
        Self { public, private }
    }

    /// Rebuild a key pair from a stored private key
    pub fn from_private(private: PrivateKey) -> Self {
        let public = PublicKey::from(&private.0);
        Self { public, private }
    }
}

/// Compute the X25519 shared secret between `public` and `private`
pub fn calculate_agreement(public: &PublicKey, private: &PrivateKey) -> [u8; 32] {
    let their_point = x25519_dalek::PublicKey::from(public.point());
    private.0.diffie_hellman(&their_point).to_bytes()
}

/// Sign `message` with XEdDSA under `private`
pub fn calculate_signature(private: &PrivateKey, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
    let signing_key = xed25519::PrivateKey::from(&private.0);
    signing_key.sign(message, &mut OsRng)
}

/// Verify an XEdDSA signature over `message` by the holder of `public`
pub fn verify_signature(
    public: &PublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<()> {
    let signature: &[u8; SIGNATURE_LENGTH] =
        signature
            .try_into()
            .map_err(|_| CryptoError::InvalidKey {
                reason: format!("Incorrect signature length: {}", signature.len()),
            })?;
    let verify_key = xed25519::PublicKey::from(&x25519_dalek::PublicKey::from(public.point()));
    verify_key
        .verify(message, signature)
        .map_err(|_| CryptoError::SignatureVerification.into())
}

/// A numbered one-time prekey pair
#[derive(Debug, Clone)]
pub struct PreKeyPair {
    /// Identifier the peer will reference in its handshake
    pub key_id: u32,
    /// The key material
    pub key_pair: KeyPair,
}

/// A numbered signed prekey pair, with the identity key's signature over
/// its encoded public half
#[derive(Debug, Clone)]
pub struct SignedPreKeyPair {
    /// Identifier the peer will reference in its handshake
    pub key_id: u32,
    /// The key material
    pub key_pair: KeyPair,
    /// XEdDSA signature by the identity key over the encoded public key
    pub signature: [u8; SIGNATURE_LENGTH],
}

/// Generate a random 14-bit registration id
pub fn generate_registration_id() -> u32 {
    let mut bytes = [0u8; 2];
    OsRng.fill_bytes(&mut bytes);
    u32::from(u16::from_le_bytes(bytes)) & 0x3fff
}

/// Generate a fresh one-time prekey pair under `key_id`
pub fn generate_pre_key(key_id: u32) -> PreKeyPair {
    PreKeyPair {
        key_id,
        key_pair: KeyPair::generate(),
    }
}

/// Generate a fresh signed prekey pair, signed by `identity`
pub fn generate_signed_pre_key(identity: &KeyPair, key_id: u32) -> SignedPreKeyPair {
    let key_pair = KeyPair::generate();
    let signature = calculate_signature(&identity.private, key_pair.public.encode());
    SignedPreKeyPair {
        key_id,
        key_pair,
        signature,
    }
}
