//! The envelope: one wire-level message.
//!
//! # Wire Format
//!
//! ```text
//! [Magic (2B)][Version (1B)][Type (1B)][Flags (1B)]
//! [SenderLen (1B)][Sender][ReceiverLen (1B)][Receiver][IdLen (1B)][MessageId]
//! [Timestamp (8B)][Lamport (8B)][TTL (4B)][ChunkIndex (4B)][TotalChunks (4B)]
//! [PayloadLen (4B)][Payload]
//! [SigLen (2B)][Signature]            (only when flag bit 0 is set)
//! ```
//!
//! All integers are big-endian. On the wire `payload` is the AEAD-sealed
//! body (`nonce || ciphertext || tag`); after the receiving session opens it
//! the same struct carries the plaintext body.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    WireError, BROADCAST_ADDRESS, DEFAULT_TTL, ENVELOPE_MAGIC, MAX_ID_LEN, MAX_PAYLOAD_SIZE,
    MAX_SIGNATURE_LEN, NO_CHUNK, TRELLIS_VERSION,
};

const FLAG_SIGNED: u8 = 0x01;

/// Domain separator for the bytes covered by the origin signature.
const SIGNING_LABEL: &[u8] = b"trellis-envelope-v1";

/// Envelope message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Hello = 0x01,
    Private = 0x02,
    Group = 0x03,
    File = 0x04,
    FileAck = 0x05,
    FileFail = 0x06,
    PeerList = 0x07,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Private),
            0x03 => Ok(Self::Group),
            0x04 => Ok(Self::File),
            0x05 => Ok(Self::FileAck),
            0x06 => Ok(Self::FileFail),
            0x07 => Ok(Self::PeerList),
            _ => Err(WireError::UnknownType(value)),
        }
    }
}

impl MessageType {
    /// Types that are flooded to every session regardless of receiver.
    pub fn is_flooded(self) -> bool {
        matches!(self, Self::Group | Self::PeerList)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "HELLO",
            Self::Private => "PRIVATE",
            Self::Group => "GROUP",
            Self::File => "FILE",
            Self::FileAck => "FILE_ACK",
            Self::FileFail => "FILE_FAIL",
            Self::PeerList => "PEER_LIST",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender_id: String,
    pub receiver_id: String,
    pub kind: MessageType,
    /// Wall-clock creation time in unix milliseconds.
    pub timestamp: i64,
    pub lamport: i64,
    /// Assigned once by the originator; forwarders never change it.
    pub message_id: String,
    pub ttl: i32,
    pub payload: Bytes,
    pub signature: Option<Bytes>,
    pub chunk_index: i32,
    pub total_chunks: i32,
}

impl Envelope {
    /// Build a fresh envelope with a new message id, the current time and
    /// the default TTL.
    pub fn new(
        sender_id: impl Into<String>,
        receiver_id: impl Into<String>,
        kind: MessageType,
        lamport: i64,
        payload: Bytes,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            receiver_id: receiver_id.into(),
            kind,
            timestamp: chrono::Utc::now().timestamp_millis(),
            lamport,
            message_id: uuid::Uuid::new_v4().to_string(),
            ttl: DEFAULT_TTL,
            payload,
            signature: None,
            chunk_index: NO_CHUNK,
            total_chunks: NO_CHUNK,
        }
    }

    pub fn with_ttl(mut self, ttl: i32) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_chunk(mut self, chunk_index: i32, total_chunks: i32) -> Self {
        self.chunk_index = chunk_index;
        self.total_chunks = total_chunks;
        self
    }

    pub fn is_broadcast_address(&self) -> bool {
        self.receiver_id.eq_ignore_ascii_case(BROADCAST_ADDRESS)
    }

    /// Whether the router floods this envelope instead of unicasting it.
    pub fn is_flooded(&self) -> bool {
        self.is_broadcast_address() || self.kind.is_flooded()
    }

    /// Milliseconds elapsed between creation and `now_ms`.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.timestamp)
    }

    /// Bytes covered by the origin signature.
    ///
    /// Every field a forwarder must not alter is included; `ttl` and the
    /// signature itself are not. `payload` is the plaintext body, so any hop
    /// that opened the envelope can verify it.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(
            SIGNING_LABEL.len() + 64 + self.sender_id.len() + self.payload.len(),
        );
        buf.put_slice(SIGNING_LABEL);
        buf.put_u8(self.kind as u8);
        for field in [&self.sender_id, &self.receiver_id, &self.message_id] {
            buf.put_u32(field.len() as u32);
            buf.put_slice(field.as_bytes());
        }
        buf.put_i64(self.timestamp);
        buf.put_i64(self.lamport);
        buf.put_i32(self.chunk_index);
        buf.put_i32(self.total_chunks);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Fails on ids longer than [`MAX_ID_LEN`], an oversized payload or an
    /// oversized signature; nothing is ever truncated.
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::FrameTooLarge(self.payload.len()));
        }
        if let Some(signature) = &self.signature {
            if signature.is_empty() || signature.len() > MAX_SIGNATURE_LEN {
                return Err(WireError::malformed(format!(
                    "signature length {}",
                    signature.len()
                )));
            }
        }

        let signature_len = self.signature.as_ref().map_or(0, |s| 2 + s.len());
        let mut buf = BytesMut::with_capacity(
            48 + self.sender_id.len()
                + self.receiver_id.len()
                + self.message_id.len()
                + self.payload.len()
                + signature_len,
        );

        buf.put_slice(&ENVELOPE_MAGIC);
        buf.put_u8(TRELLIS_VERSION);
        buf.put_u8(self.kind as u8);
        buf.put_u8(if self.signature.is_some() { FLAG_SIGNED } else { 0 });

        put_str(&mut buf, &self.sender_id, "sender_id")?;
        put_str(&mut buf, &self.receiver_id, "receiver_id")?;
        put_str(&mut buf, &self.message_id, "message_id")?;

        buf.put_i64(self.timestamp);
        buf.put_i64(self.lamport);
        buf.put_i32(self.ttl);
        buf.put_i32(self.chunk_index);
        buf.put_i32(self.total_chunks);

        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        if let Some(signature) = &self.signature {
            buf.put_u16(signature.len() as u16);
            buf.put_slice(signature);
        }

        Ok(buf.freeze())
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self, WireError> {
        ensure(&bytes, 5)?;
        let magic = [bytes.get_u8(), bytes.get_u8()];
        if magic != ENVELOPE_MAGIC {
            return Err(WireError::InvalidMagic(magic));
        }

        let version = bytes.get_u8();
        if version != TRELLIS_VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }

        let kind = MessageType::try_from(bytes.get_u8())?;
        let flags = bytes.get_u8();
        if flags & !FLAG_SIGNED != 0 {
            return Err(WireError::malformed(format!("unknown flags 0x{flags:02x}")));
        }

        let sender_id = get_str(&mut bytes, "sender_id")?;
        let receiver_id = get_str(&mut bytes, "receiver_id")?;
        let message_id = get_str(&mut bytes, "message_id")?;

        ensure(&bytes, 8 + 8 + 4 + 4 + 4 + 4)?;
        let timestamp = bytes.get_i64();
        let lamport = bytes.get_i64();
        let ttl = bytes.get_i32();
        let chunk_index = bytes.get_i32();
        let total_chunks = bytes.get_i32();

        let payload_len = bytes.get_u32() as usize;
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(WireError::FrameTooLarge(payload_len));
        }
        ensure(&bytes, payload_len)?;
        let payload = bytes.split_to(payload_len);

        let signature = if flags & FLAG_SIGNED != 0 {
            ensure(&bytes, 2)?;
            let len = bytes.get_u16() as usize;
            if len == 0 || len > MAX_SIGNATURE_LEN {
                return Err(WireError::malformed(format!("signature length {len}")));
            }
            ensure(&bytes, len)?;
            Some(bytes.split_to(len))
        } else {
            None
        };

        if bytes.has_remaining() {
            return Err(WireError::malformed(format!(
                "{} trailing bytes",
                bytes.remaining()
            )));
        }

        let envelope = Self {
            sender_id,
            receiver_id,
            kind,
            timestamp,
            lamport,
            message_id,
            ttl,
            payload,
            signature,
            chunk_index,
            total_chunks,
        };
        envelope.validate_chunk_fields()?;
        Ok(envelope)
    }

    fn validate_chunk_fields(&self) -> Result<(), WireError> {
        match self.kind {
            MessageType::File => {
                if self.total_chunks <= 0
                    || self.chunk_index < 0
                    || self.chunk_index >= self.total_chunks
                {
                    return Err(WireError::malformed(format!(
                        "chunk {}/{} out of range",
                        self.chunk_index, self.total_chunks
                    )));
                }
            }
            _ => {
                if self.chunk_index != NO_CHUNK || self.total_chunks != NO_CHUNK {
                    return Err(WireError::malformed(format!(
                        "chunk fields set on {}",
                        self.kind
                    )));
                }
            }
        }
        Ok(())
    }
}

fn ensure(bytes: &Bytes, len: usize) -> Result<(), WireError> {
    if bytes.remaining() < len {
        return Err(WireError::TooShort {
            needed: len - bytes.remaining(),
        });
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, value: &str, field: &'static str) -> Result<(), WireError> {
    let len = value.len();
    if len == 0 || len > MAX_ID_LEN {
        return Err(WireError::malformed(format!(
            "{field} is {len} bytes; must be 1..={MAX_ID_LEN}"
        )));
    }
    buf.put_u8(len as u8);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_str(bytes: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    ensure(bytes, 1)?;
    let len = bytes.get_u8() as usize;
    if len == 0 {
        return Err(WireError::malformed(format!("empty {field}")));
    }
    ensure(bytes, len)?;
    let raw = bytes.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(
            "alice",
            "bob",
            MessageType::Private,
            7,
            Bytes::from_static(b"sealed-bytes"),
        )
    }

    #[test]
    fn envelope_roundtrip_preserves_fields() {
        let mut envelope = sample();
        envelope.signature = Some(Bytes::from(vec![9u8; 64]));

        let decoded = Envelope::decode(envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn unsigned_envelope_has_no_signature() {
        let envelope = sample();
        let decoded = Envelope::decode(envelope.encode().unwrap()).unwrap();
        assert!(decoded.signature.is_none());
        assert_eq!(decoded.chunk_index, NO_CHUNK);
        assert_eq!(decoded.total_chunks, NO_CHUNK);
    }

    #[test]
    fn fresh_envelopes_get_distinct_message_ids() {
        let a = sample();
        let b = sample();
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.ttl, DEFAULT_TTL);
    }

    #[test]
    fn file_chunk_fields_are_validated() {
        let chunk = Envelope::new("a", "b", MessageType::File, 1, Bytes::from_static(b"x"))
            .with_chunk(2, 3);
        assert!(Envelope::decode(chunk.encode().unwrap()).is_ok());

        let out_of_range = chunk.clone().with_chunk(3, 3);
        assert!(matches!(
            Envelope::decode(out_of_range.encode().unwrap()),
            Err(WireError::Malformed(_))
        ));

        let stray = sample().with_chunk(0, 1);
        assert!(matches!(
            Envelope::decode(stray.encode().unwrap()),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn overlong_ids_are_refused_not_truncated() {
        let long = "é".repeat(MAX_ID_LEN);
        let envelope = Envelope::new(long.as_str(), "bob", MessageType::Private, 1, Bytes::new());
        assert!(matches!(envelope.encode(), Err(WireError::Malformed(_))));

        let exact = "x".repeat(MAX_ID_LEN);
        let envelope = Envelope::new(exact.as_str(), "bob", MessageType::Private, 1, Bytes::new());
        let decoded = Envelope::decode(envelope.encode().unwrap()).unwrap();
        assert_eq!(decoded.sender_id, exact);
    }

    #[test]
    fn invalid_magic_is_rejected() {
        let mut raw = sample().encode().unwrap().to_vec();
        raw[0] = 0xFF;
        assert!(matches!(
            Envelope::decode(Bytes::from(raw)),
            Err(WireError::InvalidMagic(_))
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut raw = sample().encode().unwrap().to_vec();
        raw[3] = 0x42;
        assert!(matches!(
            Envelope::decode(Bytes::from(raw)),
            Err(WireError::UnknownType(0x42))
        ));
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let raw = sample().encode().unwrap();
        for len in [0, 4, 12, raw.len() - 1] {
            assert!(Envelope::decode(raw.slice(..len)).is_err());
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut raw = sample().encode().unwrap().to_vec();
        raw.push(0);
        assert!(matches!(
            Envelope::decode(Bytes::from(raw)),
            Err(WireError::Malformed(_))
        ));
    }

    #[test]
    fn signing_bytes_ignore_ttl_but_cover_payload() {
        let envelope = sample();
        let forwarded = envelope.clone().with_ttl(envelope.ttl - 1);
        assert_eq!(envelope.signing_bytes(), forwarded.signing_bytes());

        let mut tampered = envelope.clone();
        tampered.payload = Bytes::from_static(b"other");
        assert_ne!(envelope.signing_bytes(), tampered.signing_bytes());

        let mut relabelled = envelope.clone();
        relabelled.sender_id = "mallory".into();
        assert_ne!(envelope.signing_bytes(), relabelled.signing_bytes());
    }

    #[test]
    fn flooding_follows_type_and_receiver() {
        assert!(!sample().is_flooded());
        let mut broadcast = sample();
        broadcast.receiver_id = "ALL".into();
        assert!(broadcast.is_flooded());
        let group = Envelope::new("a", "b", MessageType::Group, 0, Bytes::new());
        assert!(group.is_flooded());
    }
}
