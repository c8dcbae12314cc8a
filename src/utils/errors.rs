//! Error types and handling for the session protocol engine.
//!
//! Every failure surfaces to the caller as a typed error; nothing in this
//! crate retries internally. The only place errors are caught is the
//! decrypt trial loop, which collects per-session failures and reports them
//! as a single [`SessionError::NoMatchingSession`].

use thiserror::Error;

/// Result type alias for the session protocol library
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Top-level error type for all protocol operations
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// A peer's identity key does not match the one pinned for its address.
    /// Fatal; carries the address and offending key for caller-level trust
    /// decisions.
    #[error("Untrusted identity for {address}")]
    UntrustedIdentity {
        /// The address the untrusted key was presented for
        address: String,
        /// The offending identity key, base64-encoded
        identity_key: String,
    },

    /// Cryptographic primitive or validation failure
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Session state machine failure
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Failure reported by the storage backend
    #[error("Storage error: {reason}")]
    Storage {
        /// Backend-provided description
        reason: String,
    },

    /// Record or message encoding/decoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal condition
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic primitive errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey {
        /// What was wrong with the key
        reason: String,
    },

    /// MAC verification failed
    #[error("Bad MAC")]
    BadMac,

    /// MAC input had an unexpected length
    #[error("Bad MAC length: expected {expected}, got {actual}")]
    BadMacLength {
        /// Required MAC length in bytes
        expected: usize,
        /// Length actually supplied
        actual: usize,
    },

    /// HKDF salt must be exactly 32 bytes
    #[error("Got salt of incorrect length: {length}")]
    InvalidSalt {
        /// Length actually supplied
        length: usize,
    },

    /// HKDF chunk count outside the supported 1..=3 range
    #[error("Invalid number of chunks: {chunks}")]
    InvalidChunkCount {
        /// Requested chunk count
        chunks: usize,
    },

    /// Symmetric encryption failure
    #[error("Encryption failed: {reason}")]
    Encryption {
        /// Cause of the failure
        reason: String,
    },

    /// Symmetric decryption failure (bad padding, truncated input)
    #[error("Decryption failed: {reason}")]
    Decryption {
        /// Cause of the failure
        reason: String,
    },

    /// Signature verification failure
    #[error("Signature verification failed")]
    SignatureVerification,
}

/// Session state machine errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// No session record exists for the peer address
    #[error("No session record for address")]
    NoSessionRecord,

    /// The record holds no open session entry
    #[error("No open session")]
    NoOpenSession,

    /// An operation was attempted in a state that cannot support it
    #[error("Invalid session state: {reason}")]
    InvalidState {
        /// What the state conflict was
        reason: String,
    },

    /// The chain key has been discarded; no further message keys derivable
    #[error("Chain closed")]
    ChainClosed,

    /// Requested counter is too far past the chain's current position
    #[error("Over {max} messages into the future (jump of {jump})")]
    CounterTooFarAhead {
        /// Lookahead bound that was exceeded
        max: u32,
        /// Distance between the chain counter and the requested counter
        jump: u32,
    },

    /// The message key was already consumed or never derived: replay or
    /// protocol desync. Must not be retried with the same envelope.
    #[error("Message key used already or never filled")]
    MessageCounter,

    /// A one-time prekey id referenced a key the store does not hold
    #[error("Invalid prekey id")]
    InvalidPreKeyId,

    /// The referenced signed prekey is missing from the store
    #[error("Missing signed prekey")]
    MissingSignedPreKey,

    /// A prekey bundle message for an unknown peer carried no registration id
    #[error("No registration id in prekey bundle")]
    MissingRegistrationId,

    /// Message version nibbles outside the supported range
    #[error("Incompatible message version: max {max_version}, current {current_version}")]
    IncompatibleVersion {
        /// High nibble of the version byte
        max_version: u8,
        /// Low nibble of the version byte
        current_version: u8,
    },

    /// Incoming-message lookup resolved to a session whose base key is our
    /// own (reflection guard)
    #[error("Tried to look up a session using our own base key")]
    ReflectedBaseKey,

    /// A chain already exists for the given ephemeral key
    #[error("Chain overwrite attempt")]
    DuplicateChain,

    /// No chain exists for the given ephemeral key
    #[error("Chain not found")]
    UnknownChain,

    /// Every candidate session failed to decrypt the message
    #[error("No matching session found for message ({} candidates failed)", attempts.len())]
    NoMatchingSession {
        /// Per-candidate (base key, error) diagnostics
        attempts: Vec<(String, String)>,
    },

    /// The record cannot be pruned or is otherwise internally inconsistent
    #[error("Corrupt session record: {reason}")]
    RecordCorrupt {
        /// What inconsistency was found
        reason: String,
    },

    /// No migration path exists from the record's declared schema version
    #[error("Cannot migrate session record from version {version:?}")]
    Migration {
        /// The unrecognized schema version tag
        version: Option<String>,
    },
}

impl ProtocolError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if this error indicates a security violation rather
    /// than a recoverable protocol condition
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::UntrustedIdentity { .. }
                | Self::Crypto(CryptoError::BadMac)
                | Self::Crypto(CryptoError::SignatureVerification)
                | Self::Session(SessionError::MessageCounter)
                | Self::Session(SessionError::ReflectedBaseKey)
        )
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
