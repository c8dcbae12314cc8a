//! # Whisper Sessions
//!
//! An end-to-end encrypted session engine implementing X3DH key agreement
//! and the Double Ratchet algorithm, with durable multi-session records
//! per peer device.
//!
//! ## Features
//!
//! - **Forward-secure messaging**: Double Ratchet with per-message keys
//!   and bounded out-of-order delivery
//! - **Asynchronous establishment**: X3DH prekey bundles let sessions be
//!   started while the peer is offline
//! - **Multi-session records**: superseded sessions stay decryptable and
//!   are pruned on a closed-oldest-first policy
//! - **Single-writer discipline**: all work for one peer address runs
//!   through a FIFO job queue
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use whisper_sessions::{
//!     JobQueue, MemoryStore, PreKeyBundle, ProtocolAddress, ProtocolConfig,
//!     ProtocolStore, SessionBuilder, SessionCipher,
//! };
//!
//! # async fn example(bundle: PreKeyBundle) -> whisper_sessions::Result<()> {
//! let store: Arc<dyn ProtocolStore> = Arc::new(MemoryStore::new());
//! let queue = JobQueue::new();
//! let address = ProtocolAddress::new("bob", 1);
//! let config = ProtocolConfig::default();
//!
//! let builder = SessionBuilder::new(
//!     Arc::clone(&store), address.clone(), Arc::clone(&queue), config,
//! );
//! builder.init_outgoing(&bundle).await?;
//!
//! let cipher = SessionCipher::new(store, address, queue, config);
//! let message = cipher.encrypt(b"hello").await?;
//! # let _ = message;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`crypto`]: Curve25519 agreement, XEdDSA signatures, and the
//!   symmetric primitives the ratchet is built on
//! - [`session`]: handshake, ratchet cipher, session records, and the
//!   per-address job queue
//! - [`storage`]: the [`ProtocolStore`] persistence trait and an
//!   in-memory implementation
//! - [`utils`]: configuration and error types

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod crypto;
pub mod session;
pub mod storage;
pub mod utils;

// Re-export commonly used types for convenience
pub use crypto::{KeyPair, PreKeyPair, PrivateKey, PublicKey, SignedPreKeyPair};
pub use session::{
    EncryptedMessage, EnvelopeType, JobQueue, PreKeyBundle, ProtocolAddress, SessionBuilder,
    SessionCipher, SessionRecord,
};
pub use storage::{MemoryStore, ProtocolStore};
pub use utils::{LegacyKeyPolicy, ProtocolConfig, ProtocolError, Result};
