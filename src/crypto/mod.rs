//! Cryptographic providers for the session engine.
//!
//! `primitives` holds the stateless symmetric operations (block cipher,
//! MAC, bounded HKDF); `curve` holds Curve25519 key agreement, XEdDSA
//! signatures, and key-material helpers.

pub mod curve;
pub mod primitives;

pub use curve::*;
pub use primitives::*;
