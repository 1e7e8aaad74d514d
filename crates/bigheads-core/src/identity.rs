//! Node identity: stable 16-byte identifier plus a long-term X25519 keypair.
//!
//! Both are generated once at first run and persisted; the identifier never
//! changes for the lifetime of the installation.

use crate::crypto::{StaticKeypair, X25519PublicKey};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a node identifier in bytes.
pub const NODE_ID_SIZE: usize = 16;

/// A stable node identifier on the mesh.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_SIZE]);

/// The reserved broadcast destination.
pub const BROADCAST: NodeId = NodeId([0xFF; NODE_ID_SIZE]);

impl NodeId {
    /// Generate a fresh random node id.
    pub fn generate() -> Self {
        Self(crate::crypto::random_bytes::<NODE_ID_SIZE>())
    }

    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a byte slice of exactly [`NODE_ID_SIZE`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; NODE_ID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::Codec("invalid node id length".into()))?;
        Ok(Self(arr))
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.0
    }

    /// Whether this is the broadcast sentinel.
    pub fn is_broadcast(&self) -> bool {
        *self == BROADCAST
    }

    /// Full lowercase hex rendering (32 chars). Used as DB key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from the hex rendering produced by [`NodeId::to_hex`].
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::Codec("invalid node id hex".into()))?;
        Self::from_slice(&bytes)
    }

    /// Short display form for logs: first four bytes of hex.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            write!(f, "broadcast")
        } else {
            write!(f, "{}", self.short())
        }
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// The local node's identity.
pub struct NodeIdentity {
    /// Stable mesh identifier.
    id: NodeId,
    /// Long-term X25519 keypair.
    keypair: StaticKeypair,
}

impl NodeIdentity {
    /// Generate a brand-new identity.
    pub fn generate() -> Self {
        Self {
            id: NodeId::generate(),
            keypair: StaticKeypair::generate(),
        }
    }

    /// Restore an identity from persisted material.
    pub fn from_parts(id: NodeId, secret_bytes: [u8; 32]) -> Self {
        Self {
            id,
            keypair: StaticKeypair::from_secret_bytes(secret_bytes),
        }
    }

    /// The node identifier.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The long-term public key.
    pub fn public_key(&self) -> &X25519PublicKey {
        self.keypair.public_key()
    }

    /// Export the secret key bytes for persistence.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.keypair.secret_bytes()
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("id", &self.id)
            .field("keypair", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_sentinel() {
        assert!(BROADCAST.is_broadcast());
        assert!(!NodeId::generate().is_broadcast());
    }

    #[test]
    fn hex_roundtrip() {
        let id = NodeId::generate();
        let parsed = NodeId::from_hex(&id.to_hex()).expect("should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn identity_restore() {
        let original = NodeIdentity::generate();
        let restored = NodeIdentity::from_parts(original.id(), original.secret_bytes());
        assert_eq!(original.id(), restored.id());
        assert_eq!(
            original.public_key().as_bytes(),
            restored.public_key().as_bytes()
        );
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(NodeId::from_slice(&[0u8; 15]).is_err());
        assert!(NodeId::from_slice(&[0u8; 17]).is_err());
    }
}
