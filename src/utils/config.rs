//! Protocol configuration.
//!
//! The engine has deliberately few knobs. The one behavioral choice callers
//! must own is how to treat public keys delivered in the legacy untagged
//! 32-byte form: older clients emit them, so the default accepts them with a
//! logged warning, but deployments that never interoperate with such clients
//! should reject them outright.

use serde::{Deserialize, Serialize};

/// Policy for public keys received without the 1-byte format tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LegacyKeyPolicy {
    /// Accept the bare 32-byte form, logging a warning each time
    #[default]
    Warn,
    /// Reject the bare 32-byte form as an invalid key
    Reject,
}

/// Configuration for session builders and ciphers
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// How to treat untagged 32-byte public keys
    pub legacy_key_policy: LegacyKeyPolicy,
}

impl ProtocolConfig {
    /// Configuration that rejects legacy untagged public keys
    pub fn strict() -> Self {
        Self {
            legacy_key_policy: LegacyKeyPolicy::Reject,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_accepts_legacy_keys() {
        let config = ProtocolConfig::default();
        assert_eq!(config.legacy_key_policy, LegacyKeyPolicy::Warn);
    }

    #[test]
    fn test_strict_rejects_legacy_keys() {
        let config = ProtocolConfig::strict();
        assert_eq!(config.legacy_key_policy, LegacyKeyPolicy::Reject);
    }
}
