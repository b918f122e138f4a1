//! Link handshake.
//!
//! Runs once on every new TCP connection, before any envelope traffic:
//!
//! ```text
//! initiator                              responder
//!   PublicKeyMsg(own public)      ─────▶
//!                                 ◀─────  PublicKeyMsg(own public)
//!   WrappedKeyMsg(wrap(K, resp))  ─────▶
//!                                         K = unwrap(..)
//! ```
//!
//! Every read is bounded by the step timeout. Any failure aborts; the caller
//! drops the stream and registers nothing.

use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::debug;
use trellis_core::{read_frame, write_frame, Frame, WireError};

use crate::aead::SessionKey;
use crate::identity::{Identity, PublicIdentity};
use crate::wrap::{unwrap, wrap};
use crate::CryptoError;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("expected {expected}, got {got}")]
    UnexpectedFrame {
        expected: &'static str,
        got: &'static str,
    },

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Result of a completed handshake.
#[derive(Debug)]
pub struct LinkKeys {
    pub key: SessionKey,
    /// The remote side's public keys as presented in its `PublicKeyMsg`.
    pub remote: PublicIdentity,
}

/// Dialing side: announce, learn the responder, then pick and wrap the key.
pub async fn initiate<S>(
    stream: &mut S,
    identity: &Identity,
    step_timeout: Duration,
) -> Result<LinkKeys, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_public_key(stream, identity, step_timeout).await?;

    let remote = match read_step(stream, step_timeout, "PublicKeyMsg").await? {
        Frame::PublicKey(body) => PublicIdentity::from_bytes(&body)?,
        other => return Err(unexpected("PublicKeyMsg", &other)),
    };

    let key = SessionKey::generate();
    let wrapped = wrap(&key, &remote)?;
    write_step(stream, &Frame::WrappedKey(Bytes::from(wrapped)), step_timeout).await?;

    debug!(remote = %remote.fingerprint(), "handshake complete (initiator)");
    Ok(LinkKeys { key, remote })
}

/// Accepting side: learn the initiator, announce, then unwrap the key.
pub async fn respond<S>(
    stream: &mut S,
    identity: &Identity,
    step_timeout: Duration,
) -> Result<LinkKeys, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let remote = match read_step(stream, step_timeout, "PublicKeyMsg").await? {
        Frame::PublicKey(body) => PublicIdentity::from_bytes(&body)?,
        other => return Err(unexpected("PublicKeyMsg", &other)),
    };

    send_public_key(stream, identity, step_timeout).await?;

    let key = match read_step(stream, step_timeout, "WrappedKeyMsg").await? {
        Frame::WrappedKey(body) => unwrap(&body, identity)?,
        other => return Err(unexpected("WrappedKeyMsg", &other)),
    };

    debug!(remote = %remote.fingerprint(), "handshake complete (responder)");
    Ok(LinkKeys { key, remote })
}

async fn send_public_key<S>(
    stream: &mut S,
    identity: &Identity,
    step_timeout: Duration,
) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    let body = Bytes::copy_from_slice(&identity.public().to_bytes());
    write_step(stream, &Frame::PublicKey(body), step_timeout).await
}

async fn write_step<S>(
    stream: &mut S,
    frame: &Frame,
    step_timeout: Duration,
) -> Result<(), HandshakeError>
where
    S: AsyncWrite + Unpin,
{
    timeout(step_timeout, write_frame(stream, frame))
        .await
        .map_err(|_| HandshakeError::Timeout(frame.name()))??;
    Ok(())
}

async fn read_step<S>(
    stream: &mut S,
    step_timeout: Duration,
    waiting_for: &'static str,
) -> Result<Frame, HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let frame = timeout(step_timeout, read_frame(stream))
        .await
        .map_err(|_| HandshakeError::Timeout(waiting_for))??;
    Ok(frame)
}

fn unexpected(expected: &'static str, got: &Frame) -> HandshakeError {
    HandshakeError::UnexpectedFrame {
        expected,
        got: got.name(),
    }
}
