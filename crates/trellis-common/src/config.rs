//! Node configuration.
//!
//! Loaded from an optional JSON file; every field has a default so a file
//! only needs the values it changes. CLI flags are applied on top by the
//! binary before [`NodeConfig::validate`] runs.
//!
//! Example `node.json`:
//! ```json
//! {
//!   "peer_id": "alice",
//!   "port": 7100,
//!   "advertise_host": "10.0.0.5",
//!   "peers": { "bob": "10.0.0.6:7100" },
//!   "authorized_peers": ["bob", "carol"]
//! }
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use trellis_core::MAX_ID_LEN;

use crate::error::{Error, Result};

pub const DEFAULT_PORT: u16 = 7100;

/// Upper bound for `file_chunk_size`; one chunk must fit in one frame.
pub const MAX_FILE_CHUNK_SIZE: usize = 1024 * 1024;

/// Lower bound for `file_chunk_size`. Receivers size their chunk limit
/// from it, so a sender may not split finer than this.
pub const MIN_FILE_CHUNK_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub peer_id: String,
    pub listen_host: String,
    pub port: u16,
    /// Host other peers should dial; gossiped in HELLO and PEER_LIST.
    pub advertise_host: Option<String>,

    /// Envelopes older than this are dropped as replays.
    pub replay_window_ms: u64,
    pub default_ttl: i32,

    /// Concurrent connection handlers; the accept loop waits when exhausted.
    pub max_connections: usize,
    pub handshake_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub seen_capacity: usize,

    pub file_chunk_size: usize,
    pub max_file_bytes: u64,
    pub partial_file_timeout_ms: u64,
    pub download_dir: PathBuf,

    /// Static directory: peer id to `host:port`.
    pub peers: BTreeMap<String, String>,
    /// When set, only these peer ids may complete a HELLO.
    pub authorized_peers: Option<Vec<String>>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            listen_host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            advertise_host: None,
            replay_window_ms: 5 * 60 * 1000,
            default_ttl: 10,
            max_connections: 64,
            handshake_timeout_ms: 10_000,
            write_timeout_ms: 10_000,
            seen_capacity: 65_536,
            file_chunk_size: 64 * 1024,
            max_file_bytes: 64 * 1024 * 1024,
            partial_file_timeout_ms: 2 * 60 * 1000,
            download_dir: PathBuf::from("downloads"),
            peers: BTreeMap::new(),
            authorized_peers: None,
        }
    }
}

impl NodeConfig {
    /// Defaults with the given peer id.
    pub fn for_peer(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            ..Self::default()
        }
    }

    /// Read a JSON config file. Does not validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("invalid config {}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<()> {
        if self.peer_id.is_empty() {
            return Err(Error::config("peer_id must be set"));
        }
        if self
            .peer_id
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || matches!(c, ',' | '@' | '#'))
        {
            return Err(Error::config(format!(
                "peer_id {:?} contains reserved characters",
                self.peer_id
            )));
        }
        if self.peer_id.len() > MAX_ID_LEN {
            return Err(Error::config(format!(
                "peer_id is {} bytes; the limit is {MAX_ID_LEN}",
                self.peer_id.len()
            )));
        }
        if self.peer_id.eq_ignore_ascii_case("all") {
            return Err(Error::config("peer_id \"all\" is reserved for broadcast"));
        }
        if self.replay_window_ms == 0 {
            return Err(Error::config("replay_window_ms must be non-zero"));
        }
        if self.default_ttl <= 0 {
            return Err(Error::config("default_ttl must be positive"));
        }
        if self.max_connections == 0 {
            return Err(Error::config("max_connections must be non-zero"));
        }
        if self.handshake_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(Error::config("timeouts must be non-zero"));
        }
        if self.seen_capacity == 0 {
            return Err(Error::config("seen_capacity must be non-zero"));
        }
        if !(MIN_FILE_CHUNK_SIZE..=MAX_FILE_CHUNK_SIZE).contains(&self.file_chunk_size) {
            return Err(Error::config(format!(
                "file_chunk_size must be between {MIN_FILE_CHUNK_SIZE} and {MAX_FILE_CHUNK_SIZE}"
            )));
        }
        if self.max_file_bytes == 0 {
            return Err(Error::config("max_file_bytes must be non-zero"));
        }
        if self.partial_file_timeout_ms == 0 {
            return Err(Error::config("partial_file_timeout_ms must be non-zero"));
        }
        for (peer, addr) in &self.peers {
            if split_host_port(addr).is_none() {
                return Err(Error::config(format!(
                    "peer {peer}: address {addr:?} is not host:port"
                )));
            }
        }
        Ok(())
    }

    /// `host:port` this node gossips about itself, if it has a dialable one.
    pub fn advertised_addr(&self, bound_port: u16) -> Option<String> {
        let host = match &self.advertise_host {
            Some(host) => host.as_str(),
            None => {
                let unspecified = self
                    .listen_host
                    .parse::<IpAddr>()
                    .map(|ip| ip.is_unspecified())
                    .unwrap_or(false);
                if unspecified {
                    return None;
                }
                self.listen_host.as_str()
            }
        };
        Some(format!("{host}:{bound_port}"))
    }

    pub fn replay_window(&self) -> Duration {
        Duration::from_millis(self.replay_window_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn partial_file_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_file_timeout_ms)
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{ "peer_id": "alice", "port": 7200 }"#).unwrap();
        assert_eq!(config.peer_id, "alice");
        assert_eq!(config.port, 7200);
        assert_eq!(config.default_ttl, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        assert!(NodeConfig::default().validate().is_err());
        assert!(NodeConfig::for_peer("a b").validate().is_err());
        assert!(NodeConfig::for_peer("ALL").validate().is_err());
        assert!(NodeConfig::for_peer("x".repeat(MAX_ID_LEN)).validate().is_ok());
        assert!(matches!(
            NodeConfig::for_peer("x".repeat(MAX_ID_LEN + 1)).validate(),
            Err(Error::Config(_))
        ));

        let mut config = NodeConfig::for_peer("alice");
        config.default_ttl = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::for_peer("alice");
        config.file_chunk_size = 0;
        assert!(config.validate().is_err());
        config.file_chunk_size = MIN_FILE_CHUNK_SIZE - 1;
        assert!(config.validate().is_err());
        config.file_chunk_size = MIN_FILE_CHUNK_SIZE;
        assert!(config.validate().is_ok());

        let mut config = NodeConfig::for_peer("alice");
        config.replay_window_ms = 0;
        assert!(config.validate().is_err());

        let mut config = NodeConfig::for_peer("alice");
        config.peers.insert("bob".into(), "nohost".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn advertised_addr_needs_a_dialable_host() {
        let mut config = NodeConfig::for_peer("alice");
        assert_eq!(config.advertised_addr(7100), None);

        config.listen_host = "127.0.0.1".into();
        assert_eq!(config.advertised_addr(7100).as_deref(), Some("127.0.0.1:7100"));

        config.advertise_host = Some("node.example".into());
        assert_eq!(
            config.advertised_addr(7101).as_deref(),
            Some("node.example:7101")
        );
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(split_host_port("10.0.0.1:7100"), Some(("10.0.0.1", 7100)));
        assert_eq!(split_host_port("[::1]:9"), Some(("::1", 9)));
        assert_eq!(split_host_port(":9"), None);
        assert_eq!(split_host_port("host:99999"), None);
    }

    #[test]
    fn unknown_file_is_a_config_error() {
        let err = NodeConfig::load(Path::new("/nonexistent/trellis.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
