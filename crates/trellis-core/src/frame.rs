//! Length-prefixed framing over a byte stream.
//!
//! ```text
//! [Length (4B, BE)][Type (1B)][Body]
//! type 0x01 = PublicKeyMsg   (handshake, both directions)
//! type 0x02 = WrappedKeyMsg  (handshake, initiator → responder)
//! type 0x10 = Envelope       (after handshake)
//! ```
//!
//! `Length` counts the type byte and the body.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{WireError, MAX_FRAME_SIZE};

/// Frame type bytes.
pub mod frame_type {
    pub const PUBLIC_KEY: u8 = 0x01;
    pub const WRAPPED_KEY: u8 = 0x02;
    pub const ENVELOPE: u8 = 0x10;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    PublicKey(Bytes),
    WrappedKey(Bytes),
    Envelope(Bytes),
}

impl Frame {
    pub fn type_byte(&self) -> u8 {
        match self {
            Self::PublicKey(_) => frame_type::PUBLIC_KEY,
            Self::WrappedKey(_) => frame_type::WRAPPED_KEY,
            Self::Envelope(_) => frame_type::ENVELOPE,
        }
    }

    pub fn body(&self) -> &Bytes {
        match self {
            Self::PublicKey(b) | Self::WrappedKey(b) | Self::Envelope(b) => b,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PublicKey(_) => "PublicKeyMsg",
            Self::WrappedKey(_) => "WrappedKeyMsg",
            Self::Envelope(_) => "Envelope",
        }
    }

    /// Encode including the length prefix.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let body = self.body();
        let len = body.len() + 1;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(4 + len);
        buf.put_u32(len as u32);
        buf.put_u8(self.type_byte());
        buf.put_slice(body);
        Ok(buf.freeze())
    }

    /// Decode a frame without its length prefix.
    pub fn decode(mut bytes: Bytes) -> Result<Self, WireError> {
        if bytes.is_empty() {
            return Err(WireError::TooShort { needed: 1 });
        }
        let kind = bytes[0];
        let body = bytes.split_off(1);
        match kind {
            frame_type::PUBLIC_KEY => Ok(Self::PublicKey(body)),
            frame_type::WRAPPED_KEY => Ok(Self::WrappedKey(body)),
            frame_type::ENVELOPE => Ok(Self::Envelope(body)),
            other => Err(WireError::UnknownFrameType(other)),
        }
    }
}

/// Write one frame and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let data = frame.encode()?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. A closed stream surfaces as [`WireError::Io`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, WireError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len == 0 {
        return Err(WireError::TooShort { needed: 1 });
    }
    if len > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Frame::decode(Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_survive_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        write_frame(&mut a, &Frame::PublicKey(Bytes::from_static(b"key")))
            .await
            .unwrap();
        write_frame(&mut a, &Frame::Envelope(Bytes::from_static(b"env")))
            .await
            .unwrap();

        assert_eq!(
            read_frame(&mut b).await.unwrap(),
            Frame::PublicKey(Bytes::from_static(b"key"))
        );
        assert_eq!(
            read_frame(&mut b).await.unwrap(),
            Frame::Envelope(Bytes::from_static(b"env"))
        );
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_SIZE + 1) as u32).await.unwrap();

        assert!(matches!(
            read_frame(&mut b).await,
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn closed_stream_is_a_disconnect() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);

        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        assert!(matches!(
            Frame::decode(Bytes::from_static(&[0x7f, 1, 2])),
            Err(WireError::UnknownFrameType(0x7f))
        ));
    }
}
