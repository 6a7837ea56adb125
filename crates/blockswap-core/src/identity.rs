//! Node identities.
//!
//! A node is identified on the network by the Blake3 digest of its Ed25519
//! public key.

use ed25519_dalek::{SigningKey, VerifyingKey};
use std::fmt;

use crate::error::{CoreError, Result};
use crate::types::PeerId;

/// An Ed25519 keypair naming a node.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            signing_key: SigningKey::generate(&mut rng),
        }
    }

    /// Create from a 32-byte seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Raw public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(*blake3::hash(&self.public_key()).as_bytes())
    }
}

/// Derive the peer identifier for a raw public key.
pub fn peer_id_for_key(public_key: &[u8; 32]) -> Result<PeerId> {
    VerifyingKey::from_bytes(public_key).map_err(|_| CoreError::InvalidPublicKey)?;
    Ok(PeerId::from_bytes(*blake3::hash(public_key).as_bytes()))
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({:?})", self.peer_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_deterministic_from_seed() {
        let a = Identity::from_seed(&[0x42; 32]);
        let b = Identity::from_seed(&[0x42; 32]);
        assert_eq!(a.peer_id(), b.peer_id());
    }

    #[test]
    fn test_generated_identities_differ() {
        assert_ne!(Identity::generate().peer_id(), Identity::generate().peer_id());
    }

    #[test]
    fn test_peer_id_for_key_matches_identity() {
        let identity = Identity::generate();
        let derived = peer_id_for_key(&identity.public_key()).unwrap();
        assert_eq!(derived, identity.peer_id());
    }
}
