//! The group broadcast channel.
//!
//! Every node that shares the configured passphrase derives the same
//! symmetric key and can read broadcast traffic; anyone else decrypts to an
//! authentication failure. Derivation uses argon2id so passphrase guessing
//! stays expensive; the result is cached because derivation is deliberately
//! slow and must not run on the dispatcher.

use super::aead::{self, Nonce};
use super::KEY_SIZE;
use crate::error::{Error, Result};
use argon2::Argon2;
use zeroize::Zeroizing;

/// Fixed context salt. Every node must use the same value or keys diverge.
const GROUP_SALT: &[u8] = b"bigheads/group/v1";

/// AEAD cipher for the broadcast channel.
pub struct GroupCipher {
    key: Zeroizing<[u8; KEY_SIZE]>,
}

impl GroupCipher {
    /// Derive the group key from a passphrase.
    ///
    /// This runs argon2id and takes tens of milliseconds; call it from a
    /// blocking worker, never from the dispatcher.
    pub fn from_passphrase(passphrase: &str) -> Result<Self> {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), GROUP_SALT, key.as_mut())
            .map_err(|_| Error::Crypto("group key derivation failed".into()))?;
        Ok(Self { key })
    }

    /// Encrypt a broadcast payload. Returns the fresh nonce and ciphertext.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<(Nonce, Vec<u8>)> {
        let nonce = Nonce::random();
        let ciphertext = aead::encrypt(&self.key, &nonce, plaintext, aad)?;
        Ok((nonce, ciphertext))
    }

    /// Decrypt a broadcast payload.
    pub fn open(&self, nonce: &Nonce, ciphertext: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        aead::decrypt(&self.key, nonce, ciphertext, aad)
    }
}

impl std::fmt::Debug for GroupCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GroupCipher([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_passphrase_interoperates() {
        let a = GroupCipher::from_passphrase("hello").expect("derive");
        let b = GroupCipher::from_passphrase("hello").expect("derive");

        let (nonce, ct) = a.seal(b"broadcast body", b"aad").expect("seal");
        let pt = b.open(&nonce, &ct, b"aad").expect("open");
        assert_eq!(&*pt, b"broadcast body");
    }

    #[test]
    fn different_passphrase_rejects() {
        let a = GroupCipher::from_passphrase("hello").expect("derive");
        let b = GroupCipher::from_passphrase("other").expect("derive");

        let (nonce, ct) = a.seal(b"broadcast body", b"").expect("seal");
        assert!(b.open(&nonce, &ct, b"").is_err());
    }

    #[test]
    fn aad_mismatch_rejects() {
        let cipher = GroupCipher::from_passphrase("hello").expect("derive");
        let (nonce, ct) = cipher.seal(b"body", b"id-1").expect("seal");
        assert!(cipher.open(&nonce, &ct, b"id-2").is_err());
    }
}
