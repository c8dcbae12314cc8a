//! Stable identification of a (party, device) pair.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one device of one party.
///
/// The string form `name.device_id` is used as the job-queue bucket key and
/// the storage lookup key, so two addresses compare equal exactly when they
/// name the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolAddress {
    name: String,
    device_id: u32,
}

impl ProtocolAddress {
    /// Create an address for `device_id` of the party identified by `name`
    pub fn new(name: impl Into<String>, device_id: u32) -> Self {
        Self {
            name: name.into(),
            device_id,
        }
    }

    /// The opaque party identifier
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The device number within the party
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl fmt::Display for ProtocolAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_form() {
        let addr = ProtocolAddress::new("alice", 1);
        assert_eq!(addr.to_string(), "alice.1");
    }

    #[test]
    fn test_equality_includes_device() {
        let a1 = ProtocolAddress::new("alice", 1);
        let a2 = ProtocolAddress::new("alice", 2);
        assert_ne!(a1, a2);
        assert_eq!(a1, ProtocolAddress::new("alice", 1));
    }
}
