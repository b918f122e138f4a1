//! Core Trellis protocol types, framing, and constants.
//!
//! This crate provides:
//! - The [`Envelope`] wire message and its binary encoding
//! - The closed set of message [`Body`] variants carried inside an envelope
//! - Length-prefixed [`Frame`]s shared by the handshake and envelope traffic
//! - [`PeerRecord`] gossip entries used by HELLO and PEER_LIST

#![forbid(unsafe_code)]

pub mod body;
pub mod envelope;
pub mod frame;
pub mod record;

pub use body::Body;
pub use envelope::{Envelope, MessageType};
pub use frame::{read_frame, write_frame, Frame};
pub use record::PeerRecord;

pub const TRELLIS_VERSION: u8 = 1;

pub const ENVELOPE_MAGIC: [u8; 2] = [0x54, 0x52]; // 'TR'

/// Reserved receiver id addressing every reachable peer.
pub const BROADCAST_ADDRESS: &str = "all";

/// Hop budget stamped on locally originated envelopes.
pub const DEFAULT_TTL: i32 = 10;

/// Chunk fields of every non-FILE envelope.
pub const NO_CHUNK: i32 = -1;

/// Longest sender, receiver or message id accepted on the wire.
pub const MAX_ID_LEN: usize = 255;

/// Maximum frame size accepted from a socket (4 MiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Maximum envelope payload; leaves room for the header inside one frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - 4096;

/// Maximum signature length accepted on the wire.
pub const MAX_SIGNATURE_LEN: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("packet too short: need {needed} more bytes")]
    TooShort { needed: usize },
    #[error("invalid magic: {0:?}")]
    InvalidMagic([u8; 2]),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type: 0x{0:02x}")]
    UnknownType(u8),
    #[error("unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("malformed: {0}")]
    Malformed(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub fn malformed(msg: impl std::fmt::Display) -> Self {
        Self::Malformed(msg.to_string())
    }

    /// True when the underlying transport is gone rather than the bytes being bad.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
