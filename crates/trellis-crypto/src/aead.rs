//! Per-link payload sealing.
//!
//! ```text
//! [12 bytes: nonce] [ciphertext] [16 bytes: auth tag]
//! ```
//!
//! A fresh random nonce is drawn for every call. With 96-bit nonces and one
//! key per link this stays far below the birthday bound for any realistic
//! session.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Symmetric key shared by the two ends of one link.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    /// Generate a new random key using the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!(
                "session key must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    ///
    /// # Security
    /// Only for wrapping; never log or persist these.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.0))
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        // Not constant time; only used by tests and handshake assertions.
        self.0 == other.0
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Encrypt `plaintext`, returning `nonce || ciphertext || tag`.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = key
        .cipher()
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt the output of [`seal`]. Any modification fails with
/// [`CryptoError::AuthFailed`].
pub fn open(key: &SessionKey, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::TooShort(sealed.len()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    key.cipher()
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_reverses_seal() {
        let key = SessionKey::generate();
        let sealed = seal(&key, b"hello trellis").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 13 + TAG_LEN);
        assert_eq!(open(&key, &sealed).unwrap(), b"hello trellis");
    }

    #[test]
    fn every_tampered_byte_is_detected() {
        let key = SessionKey::generate();
        let sealed = seal(&key, b"payload").unwrap();
        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            assert!(matches!(open(&key, &tampered), Err(CryptoError::AuthFailed)));
        }
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = seal(&SessionKey::generate(), b"x").unwrap();
        assert!(open(&SessionKey::generate(), &sealed).is_err());
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let key = SessionKey::generate();
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn short_input_is_rejected() {
        let key = SessionKey::generate();
        assert!(matches!(open(&key, &[0u8; 10]), Err(CryptoError::TooShort(10))));
    }

    #[test]
    fn debug_redacts_key() {
        let key = SessionKey::from_bytes([0xAB; KEY_LEN]);
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("ab"));
        assert!(!rendered.contains("171"));
    }
}
