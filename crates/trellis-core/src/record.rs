//! Peer records gossiped in HELLO and PEER_LIST bodies.
//!
//! A record is `id[@host:port][#signing-key]`; a list is the comma-joined
//! form. The signing key is the base64url Ed25519 public key of the peer.

use std::fmt;
use std::str::FromStr;

use crate::{WireError, MAX_ID_LEN};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerRecord {
    pub peer_id: String,
    pub addr: Option<String>,
    pub signing_key: Option<String>,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            addr: None,
            signing_key: None,
        }
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = Some(addr.into());
        self
    }

    pub fn with_signing_key(mut self, key: impl Into<String>) -> Self {
        self.signing_key = Some(key.into());
        self
    }

    /// Parse a comma-joined list, skipping blank and malformed entries.
    pub fn parse_list(input: &str) -> Vec<PeerRecord> {
        input
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| entry.parse().ok())
            .collect()
    }

    pub fn join_list<'a>(records: impl IntoIterator<Item = &'a PeerRecord>) -> String {
        records
            .into_iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Peer ids are free-form but may not contain record separators.
pub fn is_valid_peer_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && !id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ',' | '@' | '#'))
}

impl FromStr for PeerRecord {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, signing_key) = match s.split_once('#') {
            Some((rest, key)) => (rest, Some(key)),
            None => (s, None),
        };
        let (peer_id, addr) = match rest.split_once('@') {
            Some((id, addr)) => (id, Some(addr)),
            None => (rest, None),
        };

        if !is_valid_peer_id(peer_id) {
            return Err(WireError::malformed(format!("invalid peer id {peer_id:?}")));
        }
        if let Some(addr) = addr {
            if addr.is_empty() || addr.contains(|c: char| c.is_whitespace() || c == ',') {
                return Err(WireError::malformed(format!("invalid address {addr:?}")));
            }
        }
        if let Some(key) = signing_key {
            let valid = !key.is_empty()
                && key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !valid {
                return Err(WireError::malformed("invalid signing key encoding"));
            }
        }

        Ok(Self {
            peer_id: peer_id.to_string(),
            addr: addr.map(str::to_string),
            signing_key: signing_key.map(str::to_string),
        })
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.peer_id)?;
        if let Some(addr) = &self.addr {
            write!(f, "@{addr}")?;
        }
        if let Some(key) = &self.signing_key {
            write!(f, "#{key}")?;
        }
        Ok(())
    }
}
