//! Peer identity and the dial tie-break rule

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one device instance for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Opaque id, compared lexicographically for tie-breaks
    pub id: String,

    /// Display name
    pub name: String,
}

impl PeerIdentity {
    /// Create an identity with a fixed id
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Generate a fresh identity for a new session.
    ///
    /// Uses the 32-char lowercase hex form of a v4 uuid so every id has the
    /// same length and alphabet and byte-wise ordering is well defined.
    pub fn generate(name: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().simple().to_string(), name)
    }

    /// Whether this side dials `remote_id` when both discover each other
    pub fn initiates_to(&self, remote_id: &str) -> bool {
        should_initiate(&self.id, remote_id)
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// The side whose id sorts lexicographically smaller always initiates.
///
/// Equal ids never initiate, which also keeps a node from dialing itself.
pub fn should_initiate(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_side_initiates() {
        let pairs = [("a", "b"), ("phone-b", "phone-a"), ("10", "9"), ("A", "a")];
        for (x, y) in pairs {
            let dials = [should_initiate(x, y), should_initiate(y, x)];
            assert_eq!(dials.iter().filter(|d| **d).count(), 1, "pair {x}/{y}");
        }
    }

    #[test]
    fn test_self_never_initiates() {
        let me = PeerIdentity::new("same", "me");
        assert!(!me.initiates_to("same"));
    }

    #[test]
    fn test_generated_ids_are_uniform() {
        let a = PeerIdentity::generate("a");
        let b = PeerIdentity::generate("b");
        assert_ne!(a.id, b.id);
        assert_eq!(a.id.len(), 32);
        assert!(a.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a.initiates_to(&b.id), b.initiates_to(&a.id));
    }
}
