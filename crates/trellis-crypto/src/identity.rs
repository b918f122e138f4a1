//! Node identity keys.
//!
//! An [`Identity`] holds two long-term secrets generated together:
//! an Ed25519 signing key for envelope signatures and an X25519 static key
//! that link keys are wrapped to. The public halves travel together as a
//! 64-byte `PublicKeyMsg` body:
//!
//! ```text
//! [32 bytes: Ed25519 verifying key] [32 bytes: X25519 public key]
//! ```
//!
//! # Example
//!
//! ```
//! use trellis_crypto::identity::Identity;
//!
//! let identity = Identity::generate();
//! let signature = identity.sign(b"challenge");
//! assert!(identity.public().verify(b"challenge", &signature));
//! ```

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::CryptoError;

pub const PUBLIC_IDENTITY_LEN: usize = 64;
pub const SIGNATURE_LEN: usize = 64;

/// Long-term keypairs owned by a node for its process lifetime.
pub struct Identity {
    signing_key: SigningKey,
    kex_secret: StaticSecret,
}

impl Identity {
    /// Generate new random keys using the OS CSPRNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            kex_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn public(&self) -> PublicIdentity {
        PublicIdentity {
            signer: PeerKey(self.signing_key.verifying_key()),
            kex_key: X25519PublicKey::from(&self.kex_secret),
        }
    }

    /// Sign a message with the Ed25519 key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    pub(crate) fn kex_secret(&self) -> &StaticSecret {
        &self.kex_secret
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.public().fingerprint())
            .finish_non_exhaustive()
    }
}

/// Ed25519 verifying key of a remote peer.
///
/// Its text form is the base64url (no padding) encoding of the 32 key bytes,
/// which is what peer records gossip after `#`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerKey(VerifyingKey);

impl PeerKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| CryptoError::InvalidKey(format!("ed25519 key: {e}")))
    }

    /// Parse the base64url gossip form.
    pub fn parse(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| CryptoError::InvalidKey("invalid base64url encoding".into()))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|v: Vec<u8>| {
            CryptoError::InvalidKey(format!("expected 32 bytes, got {}", v.len()))
        })?;
        Self::from_bytes(&bytes)
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// Verify a signature. Malformed signatures simply fail.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let sig = match Signature::from_slice(signature) {
            Ok(s) => s,
            Err(_) => return false,
        };
        self.0.verify(message, &sig).is_ok()
    }

    /// Short hex fingerprint for logs.
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.0.as_bytes())[..8])
    }
}

impl fmt::Debug for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerKey({})", self.fingerprint())
    }
}

/// Public half of an [`Identity`], as exchanged during the handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    signer: PeerKey,
    kex_key: X25519PublicKey,
}

impl PublicIdentity {
    pub fn to_bytes(&self) -> [u8; PUBLIC_IDENTITY_LEN] {
        let mut out = [0u8; PUBLIC_IDENTITY_LEN];
        out[..32].copy_from_slice(self.signer.as_bytes());
        out[32..].copy_from_slice(self.kex_key.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_IDENTITY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "public identity must be {PUBLIC_IDENTITY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut signer = [0u8; 32];
        signer.copy_from_slice(&bytes[..32]);
        let mut kex = [0u8; 32];
        kex.copy_from_slice(&bytes[32..]);

        Ok(Self {
            signer: PeerKey::from_bytes(&signer)?,
            kex_key: X25519PublicKey::from(kex),
        })
    }

    /// The signing half, used to verify HELLO and pinned in the keyring.
    pub fn peer_key(&self) -> PeerKey {
        self.signer
    }

    pub(crate) fn kex_key(&self) -> &X25519PublicKey {
        &self.kex_key
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        self.signer.verify(message, signature)
    }

    /// Short hex fingerprint over both keys.
    pub fn fingerprint(&self) -> String {
        hex::encode(&Sha256::digest(self.to_bytes())[..8])
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({})", self.fingerprint())
    }
}
