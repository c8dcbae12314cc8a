//! Symmetric primitives: AES-256-CBC, HMAC-SHA256, and the bounded HKDF.
//!
//! These are the stateless building blocks the ratchet engine is written
//! against. `derive_secrets` is a specific rendition of RFC 5869 that only
//! ever produces the first three 32-byte chunks, which is all the protocol
//! consumes: (root key, chain key) pairs from ratchet steps and
//! (cipher key, MAC key, IV source) triples from message keys.

use crate::utils::{CryptoError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Size of symmetric keys and HKDF output chunks
pub const KEY_SIZE: usize = 32;

/// Size of the AES-CBC initialization vector
pub const IV_SIZE: usize = 16;

/// Encrypt with AES-256-CBC and PKCS#7 padding
pub fn encrypt(key: &[u8; KEY_SIZE], data: &[u8], iv: &[u8; IV_SIZE]) -> Vec<u8> {
    Aes256CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data)
}

/// Decrypt AES-256-CBC ciphertext, stripping PKCS#7 padding
pub fn decrypt(key: &[u8; KEY_SIZE], data: &[u8], iv: &[u8; IV_SIZE]) -> Result<Vec<u8>> {
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| {
            CryptoError::Decryption {
                reason: "Bad padding or truncated ciphertext".to_string(),
            }
            .into()
        })
}

/// Compute HMAC-SHA256 over `data` with `key`
pub fn calculate_mac(key: &[u8], data: &[u8]) -> [u8; KEY_SIZE] {
    // HMAC accepts keys of any length; construction cannot fail.
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Compute SHA-256 over `data`
pub fn hash(data: &[u8]) -> [u8; KEY_SIZE] {
    Sha256::digest(data).into()
}

/// Bounded HKDF: derive up to three 32-byte chunks from `input`.
///
/// The salt must be exactly 32 bytes. Each chunk after the first is derived
/// from the previous chunk's output followed by `info` and a 1-byte chunk
/// index, exactly as RFC 5869 expansion specifies.
pub fn derive_secrets(
    input: &[u8],
    salt: &[u8],
    info: &[u8],
    chunks: usize,
) -> Result<Vec<[u8; KEY_SIZE]>> {
    if salt.len() != KEY_SIZE {
        return Err(CryptoError::InvalidSalt { length: salt.len() }.into());
    }
    if !(1..=3).contains(&chunks) {
        return Err(CryptoError::InvalidChunkCount { chunks }.into());
    }

    let prk = calculate_mac(salt, input);

    let mut message = Vec::with_capacity(KEY_SIZE + info.len() + 1);
    message.extend_from_slice(info);
    message.push(1);
    let mut chunk = calculate_mac(&prk, &message);

    let mut derived = Vec::with_capacity(chunks);
    derived.push(chunk);
    for index in 2..=chunks as u8 {
        message.clear();
        message.extend_from_slice(&chunk);
        message.extend_from_slice(info);
        message.push(index);
        chunk = calculate_mac(&prk, &message);
        derived.push(chunk);
    }
    Ok(derived)
}

/// Verify a truncated HMAC-SHA256 in constant time.
///
/// `length` is the truncation length in bytes; `mac` must be exactly that
/// long. Length mismatches fail before any comparison happens.
pub fn verify_mac(data: &[u8], key: &[u8], mac: &[u8], length: usize) -> Result<()> {
    if mac.len() != length || length > KEY_SIZE {
        return Err(CryptoError::BadMacLength {
            expected: length,
            actual: mac.len(),
        }
        .into());
    }
    let calculated = calculate_mac(key, data);
    if calculated[..length].ct_eq(mac).into() {
        Ok(())
    } else {
        Err(CryptoError::BadMac.into())
    }
}
