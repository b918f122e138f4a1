//! Wrapping a link key to one recipient.
//!
//! ```text
//! [32 bytes: ephemeral X25519 public] [12 bytes: nonce] [48 bytes: sealed key + tag]
//! ```
//!
//! The sender runs X25519 between a one-shot ephemeral secret and the
//! recipient's static key, derives a wrapping key with HKDF-SHA256 (salted
//! with both public keys), and seals the link key under it. Only the holder
//! of the recipient's static secret can derive the same wrapping key.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::aead::{self, SessionKey, KEY_LEN, NONCE_LEN, TAG_LEN};
use crate::identity::{Identity, PublicIdentity};
use crate::CryptoError;

const WRAP_INFO: &[u8] = b"trellis-key-wrap-v1";

/// Length of a `WrappedKeyMsg` body.
pub const WRAPPED_KEY_LEN: usize = 32 + NONCE_LEN + KEY_LEN + TAG_LEN;

/// Wrap `key` so that only `recipient` can recover it.
pub fn wrap(key: &SessionKey, recipient: &PublicIdentity) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = StaticSecret::random_from_rng(OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);

    let recipient_public = recipient.kex_key();
    let wrapping_key = derive_shared(
        &ephemeral,
        recipient_public,
        &ephemeral_public,
        recipient_public,
    )?;
    let sealed = aead::seal(&wrapping_key, key.as_bytes())?;

    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Recover a key produced by [`wrap`] for `own`.
pub fn unwrap(wrapped: &[u8], own: &Identity) -> Result<SessionKey, CryptoError> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "wrapped key must be {WRAPPED_KEY_LEN} bytes, got {}",
            wrapped.len()
        )));
    }

    let mut ephemeral = [0u8; 32];
    ephemeral.copy_from_slice(&wrapped[..32]);
    let ephemeral_public = X25519PublicKey::from(ephemeral);
    let own_public = X25519PublicKey::from(own.kex_secret());

    let wrapping_key = derive_shared(
        own.kex_secret(),
        &ephemeral_public,
        &ephemeral_public,
        &own_public,
    )?;
    let mut raw = aead::open(&wrapping_key, &wrapped[32..])?;
    let key = SessionKey::from_slice(&raw);
    raw.zeroize();
    key
}

/// DH between `secret` and `their`, then HKDF salted with
/// `ephemeral_public || recipient_public` so both sides agree on the salt.
fn derive_shared(
    secret: &StaticSecret,
    their: &X25519PublicKey,
    ephemeral_public: &X25519PublicKey,
    recipient_public: &X25519PublicKey,
) -> Result<SessionKey, CryptoError> {
    let shared = secret.diffie_hellman(their);
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey("low-order x25519 point".into()));
    }

    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral_public.as_bytes());
    salt[32..].copy_from_slice(recipient_public.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut okm = [0u8; KEY_LEN];
    hk.expand(WRAP_INFO, &mut okm)
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF-SHA256 expansion failed: {e}")))?;
    let key = SessionKey::from_bytes(okm);
    okm.zeroize();
    Ok(key)
}
