//! Authenticated encryption using ChaCha20-Poly1305.
//!
//! The associated data binds an envelope's routing metadata to its
//! ciphertext, so a relay cannot re-address a message without breaking
//! authentication.

use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce as ChaNonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

/// Size of encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// A nonce for AEAD encryption. Must be unique per key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a new random nonce. Safe for the group channel where keys are
    /// long-lived but messages are few relative to the birthday bound.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// All-zero nonce, used for cleartext handshake envelopes where the
    /// payload is not AEAD-protected at all.
    pub fn zero() -> Self {
        Self([0u8; NONCE_SIZE])
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl From<[u8; NONCE_SIZE]> for Nonce {
    fn from(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Deterministic nonce for the N-th message on a pairwise chain:
/// four zero bytes followed by the counter, big-endian.
pub fn counter_nonce(counter: u64) -> Nonce {
    let mut bytes = [0u8; NONCE_SIZE];
    bytes[4..].copy_from_slice(&counter.to_be_bytes());
    Nonce(bytes)
}

/// Encrypt plaintext; output is ciphertext with the 16-byte tag appended.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &Nonce,
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let cha_nonce = ChaNonce::from_slice(nonce.as_bytes());

    cipher
        .encrypt(
            cha_nonce,
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::Crypto("encryption failed".into()))
}

/// Decrypt ciphertext. Returns a generic error on any failure so callers
/// cannot distinguish wrong-key from tampered-data.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &Nonce,
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let cha_nonce = ChaNonce::from_slice(nonce.as_bytes());

    let plaintext = cipher
        .decrypt(
            cha_nonce,
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| Error::Crypto("decryption failed".into()))?;

    Ok(Zeroizing::new(plaintext))
}
