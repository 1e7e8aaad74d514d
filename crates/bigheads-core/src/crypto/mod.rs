//! Cryptographic primitives for the BigHeads mesh.
//!
//! - **X25519**: ephemeral key agreement for pairwise chats
//! - **ChaCha20-Poly1305**: authenticated encryption for every payload
//! - **HKDF-SHA256**: key derivation throughout
//! - **argon2id**: slow derivation of the group key from the passphrase
//!
//! The pairwise handshake is an unauthenticated NN-style exchange: it gives
//! confidentiality against passive observers only. No custom primitives.

mod aead;
mod group;
mod keys;
mod pairwise;

pub use aead::{decrypt, encrypt, counter_nonce, Nonce, NONCE_SIZE, TAG_SIZE};
pub use group::GroupCipher;
pub use keys::{EphemeralKeypair, SharedSecret, StaticKeypair, X25519PublicKey, X25519_KEY_SIZE};
pub use pairwise::{
    HandshakeRole, HandshakeState, PairwiseSession, SessionSnapshot, SKIP_WINDOW,
};

use crate::error::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Key size for ChaCha20-Poly1305.
pub const KEY_SIZE: usize = 32;

/// Derive a 32-byte key using HKDF-SHA256.
pub fn hkdf_derive(salt: Option<&[u8]>, ikm: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut output = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(info, output.as_mut())
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;
    Ok(output)
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Constant-time comparison of byte slices.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hkdf_is_deterministic_and_domain_separated() {
        let ikm = b"input key material";

        let a = hkdf_derive(None, ikm, b"bigheads/nn/v1").expect("derive");
        let b = hkdf_derive(None, ikm, b"bigheads/nn/v1").expect("derive");
        let c = hkdf_derive(None, ikm, b"other").expect("derive");

        assert_eq!(&*a, &*b);
        assert_ne!(&*a, &*c);
    }

    #[test]
    fn random_bytes_differ() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"same", b"longer"));
    }
}
