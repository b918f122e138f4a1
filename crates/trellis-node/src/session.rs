//! One authenticated link to a directly connected peer.
//!
//! A session owns the write half of its TCP stream and the link key agreed
//! by the handshake. Writes are serialized by the session's own mutex, so
//! concurrent routes never interleave frames on one socket.
//!
//! Lifecycle:
//! - PENDING: handshake done, registered as `pending-<conn>`, no traffic routed
//! - VERIFIED: a signed HELLO bound a peer id to the handshake key
//! - CLOSED: removed or failed; pending and future writes fail, the read
//!   loop unblocks

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use trellis_core::{write_frame, Envelope, Frame, WireError};
use trellis_crypto::{open, seal, CryptoError, LinkKeys, PeerKey, PublicIdentity, SessionKey};

/// Prefix of the provisional id a session carries until its HELLO.
pub const PENDING_PREFIX: &str = "pending-";

/// Keyed by connection, not address: peers behind one NAT share an address.
pub fn pending_id(conn_id: u64) -> String {
    format!("{PENDING_PREFIX}{conn_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

impl From<SessionError> for trellis_common::Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Closed => Self::Transport(std::io::ErrorKind::NotConnected.into()),
            SessionError::WriteTimeout(after) => {
                Self::timeout(format!("write timed out after {after:?}"))
            }
            SessionError::Crypto(e) => Self::crypto(e),
            SessionError::Wire(WireError::Io(e)) => Self::Transport(e),
            SessionError::Wire(e) => Self::protocol(e),
        }
    }
}

pub struct Session {
    conn_id: u64,
    peer_id: StdMutex<String>,
    remote_addr: SocketAddr,
    inbound: bool,
    key: SessionKey,
    remote: PublicIdentity,
    writer: Mutex<OwnedWriteHalf>,
    write_timeout: Duration,
    verified: AtomicBool,
    verified_notify: Notify,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl Session {
    pub fn new(
        conn_id: u64,
        remote_addr: SocketAddr,
        inbound: bool,
        link: LinkKeys,
        writer: OwnedWriteHalf,
        write_timeout: Duration,
    ) -> Self {
        Self {
            conn_id,
            peer_id: StdMutex::new(pending_id(conn_id)),
            remote_addr,
            inbound,
            key: link.key,
            remote: link.remote,
            writer: Mutex::new(writer),
            write_timeout,
            verified: AtomicBool::new(false),
            verified_notify: Notify::new(),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        }
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Current routing id: provisional until the HELLO is accepted.
    pub fn peer_id(&self) -> String {
        self.peer_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Only the router calls this, under its write lock.
    pub(crate) fn set_peer_id(&self, id: &str) {
        *self.peer_id.lock().unwrap_or_else(PoisonError::into_inner) = id.to_string();
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether the remote side dialed us.
    pub fn is_inbound(&self) -> bool {
        self.inbound
    }

    /// Signing key presented in the handshake.
    pub fn remote_key(&self) -> PeerKey {
        self.remote.peer_key()
    }

    pub fn remote_fingerprint(&self) -> String {
        self.remote.fingerprint()
    }

    pub fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }

    /// Returns `true` if this call performed the transition.
    pub fn mark_verified(&self) -> bool {
        let first = !self.verified.swap(true, Ordering::SeqCst);
        self.verified_notify.notify_waiters();
        first
    }

    /// Resolves `true` once verified, `false` if the session closes first.
    pub async fn wait_verified(&self) -> bool {
        loop {
            let notified = self.verified_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_verified() {
                return true;
            }
            if self.is_closed() {
                return false;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.closed() => return self.is_verified(),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark closed and wake the read loop. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!(conn = self.conn_id, peer = %self.peer_id(), "session closed");
        }
        self.closed_notify.notify_waiters();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        let notified = self.closed_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Shut down the write half once the read loop is done.
    pub async fn shutdown(&self) {
        self.close();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Seal `envelope` (plaintext payload) under this link's key and write it.
    ///
    /// A write that fails or stalls past the write timeout closes the session.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }

        let mut sealed = envelope.clone();
        sealed.payload = Bytes::from(seal(&self.key, &envelope.payload)?);
        let frame = Frame::Envelope(sealed.encode()?);

        let mut writer = self.writer.lock().await;
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        match tokio::time::timeout(self.write_timeout, write_frame(&mut *writer, &frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.close();
                Err(e.into())
            }
            Err(_) => {
                self.close();
                Err(SessionError::WriteTimeout(self.write_timeout))
            }
        }
    }

    /// Replace the sealed payload of an inbound envelope with its plaintext.
    pub fn open(&self, mut envelope: Envelope) -> Result<Envelope, CryptoError> {
        envelope.payload = Bytes::from(open(&self.key, &envelope.payload)?);
        Ok(envelope)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("conn_id", &self.conn_id)
            .field("peer_id", &self.peer_id())
            .field("remote_addr", &self.remote_addr)
            .field("verified", &self.is_verified())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
