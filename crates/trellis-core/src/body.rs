//! Decoded envelope bodies.
//!
//! Every [`MessageType`] maps to exactly one [`Body`] variant, so handlers
//! match exhaustively instead of switching on a type byte.

use bytes::Bytes;

use crate::envelope::{Envelope, MessageType};
use crate::record::PeerRecord;
use crate::{WireError, NO_CHUNK};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// The sender's own record: id, listen address and signing key.
    Hello(PeerRecord),
    Private(String),
    Group(String),
    File {
        chunk_index: u32,
        total_chunks: u32,
        data: Bytes,
    },
    FileAck(String),
    FileFail(String),
    PeerList(Vec<PeerRecord>),
}

impl Body {
    pub fn kind(&self) -> MessageType {
        match self {
            Self::Hello(_) => MessageType::Hello,
            Self::Private(_) => MessageType::Private,
            Self::Group(_) => MessageType::Group,
            Self::File { .. } => MessageType::File,
            Self::FileAck(_) => MessageType::FileAck,
            Self::FileFail(_) => MessageType::FileFail,
            Self::PeerList(_) => MessageType::PeerList,
        }
    }

    /// Plaintext payload bytes for this body.
    pub fn to_payload(&self) -> Bytes {
        match self {
            Self::Hello(record) => Bytes::from(record.to_string()),
            Self::Private(text) | Self::Group(text) | Self::FileAck(text) | Self::FileFail(text) => {
                Bytes::from(text.clone())
            }
            Self::File { data, .. } => data.clone(),
            Self::PeerList(records) => Bytes::from(PeerRecord::join_list(records)),
        }
    }

    /// `(chunk_index, total_chunks)` as carried in the envelope header.
    pub fn chunk_fields(&self) -> (i32, i32) {
        match self {
            Self::File {
                chunk_index,
                total_chunks,
                ..
            } => (*chunk_index as i32, *total_chunks as i32),
            _ => (NO_CHUNK, NO_CHUNK),
        }
    }

    /// Interpret an opened envelope's plaintext payload.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, WireError> {
        let payload = &envelope.payload;
        match envelope.kind {
            MessageType::Hello => {
                let text = utf8(payload, "hello")?;
                Ok(Self::Hello(text.trim().parse()?))
            }
            MessageType::Private => Ok(Self::Private(utf8(payload, "private text")?)),
            MessageType::Group => Ok(Self::Group(utf8(payload, "group text")?)),
            MessageType::File => {
                if envelope.total_chunks <= 0
                    || envelope.chunk_index < 0
                    || envelope.chunk_index >= envelope.total_chunks
                {
                    return Err(WireError::malformed("file chunk out of range"));
                }
                Ok(Self::File {
                    chunk_index: envelope.chunk_index as u32,
                    total_chunks: envelope.total_chunks as u32,
                    data: payload.clone(),
                })
            }
            MessageType::FileAck => Ok(Self::FileAck(utf8(payload, "file ack")?)),
            MessageType::FileFail => Ok(Self::FileFail(utf8(payload, "file failure reason")?)),
            MessageType::PeerList => Ok(Self::PeerList(PeerRecord::parse_list(&utf8(
                payload,
                "peer list",
            )?))),
        }
    }
}

fn utf8(payload: &Bytes, field: &'static str) -> Result<String, WireError> {
    String::from_utf8(payload.to_vec()).map_err(|_| WireError::InvalidUtf8(field))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_for(body: &Body) -> Envelope {
        let (index, total) = body.chunk_fields();
        Envelope::new("a", "b", body.kind(), 1, body.to_payload()).with_chunk(index, total)
    }

    #[test]
    fn every_body_matches_its_envelope_type() {
        let bodies = vec![
            Body::Hello(PeerRecord::new("a").with_addr("127.0.0.1:7100")),
            Body::Private("hi".into()),
            Body::Group("hello all".into()),
            Body::File {
                chunk_index: 1,
                total_chunks: 2,
                data: Bytes::from_static(b"\x00\x01"),
            },
            Body::FileAck("OK".into()),
            Body::FileFail("disk full".into()),
            Body::PeerList(vec![PeerRecord::new("a"), PeerRecord::new("b")]),
        ];

        for body in bodies {
            let envelope = envelope_for(&body);
            assert_eq!(Body::from_envelope(&envelope).unwrap(), body);
        }
    }

    #[test]
    fn invalid_utf8_text_is_rejected() {
        let envelope = Envelope::new(
            "a",
            "b",
            MessageType::Private,
            1,
            Bytes::from_static(&[0xff, 0xfe]),
        );
        assert!(matches!(
            Body::from_envelope(&envelope),
            Err(WireError::InvalidUtf8(_))
        ));
    }

    #[test]
    fn hello_requires_a_valid_record() {
        let envelope = Envelope::new("a", "b", MessageType::Hello, 1, Bytes::from_static(b""));
        assert!(Body::from_envelope(&envelope).is_err());
    }
}
