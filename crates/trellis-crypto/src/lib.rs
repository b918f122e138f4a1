//! Cryptographic primitives for Trellis.
//!
//! This crate provides:
//! - Long-term node identities (Ed25519 signing + X25519 key agreement)
//! - ChaCha20-Poly1305 sealing of envelope payloads under a per-link key
//! - Wrapping of a fresh link key for one recipient
//! - The four-message link handshake run on every new connection
//!
//! # Design
//!
//! Each link gets its own random 32-byte key, chosen by the dialing side and
//! wrapped to the other side's static X25519 key. There is no ratchet and no
//! renegotiation: the key lives as long as the connection does.
//!
//! Authenticity of a peer id is not established here. The handshake only
//! proves possession of the exchanged keys; the signed HELLO that follows
//! binds an id to them.

#![forbid(unsafe_code)]

pub mod aead;
pub mod handshake;
pub mod identity;
pub mod wrap;

pub use aead::{open, seal, SessionKey};
pub use handshake::{initiate, respond, HandshakeError, LinkKeys};
pub use identity::{Identity, PeerKey, PublicIdentity};
pub use wrap::{unwrap, wrap};

/// Errors from key handling, sealing and signature checks.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("auth tag mismatch")]
    AuthFailed,

    #[error("ciphertext too short: {0} bytes")]
    TooShort(usize),

    #[error("encryption failed")]
    Encryption,

    #[error("signature mismatch")]
    BadSignature,
}
