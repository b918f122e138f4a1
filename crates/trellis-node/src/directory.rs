//! Peer address lookup used when dialing peers learned from gossip.

use std::collections::HashMap;

/// Maps a peer id to a dialable `host:port`.
pub trait PeerDirectory: Send + Sync {
    fn resolve(&self, peer_id: &str) -> Option<String>;
}

/// Fixed directory built from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    entries: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl PeerDirectory for StaticDirectory {
    fn resolve(&self, peer_id: &str) -> Option<String> {
        self.entries.get(peer_id).cloned()
    }
}
