//! Admission checks run when a HELLO binds a peer id to a link, when gossip
//! introduces a peer, and when a relayed envelope names its origin.

use std::collections::HashSet;

use trellis_crypto::PeerKey;

pub trait Authorizer: Send + Sync {
    /// Whether `peer_id`, presenting `key`, may join through this node.
    fn is_authorized(&self, peer_id: &str, key: &PeerKey) -> bool;

    /// Whether `peer_id` could be admitted at all, before any key is known.
    fn admits(&self, _peer_id: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn is_authorized(&self, _peer_id: &str, _key: &PeerKey) -> bool {
        true
    }
}

/// Admits only the listed peer ids.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    peers: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            peers: peers.into_iter().map(Into::into).collect(),
        }
    }
}

impl Authorizer for AllowList {
    fn is_authorized(&self, peer_id: &str, _key: &PeerKey) -> bool {
        self.admits(peer_id)
    }

    fn admits(&self, peer_id: &str) -> bool {
        self.peers.contains(peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_crypto::Identity;

    #[test]
    fn allow_list_admits_only_listed_ids() {
        let key = Identity::generate().public().peer_key();
        let list = AllowList::new(["bob", "carol"]);
        assert!(list.is_authorized("bob", &key));
        assert!(!list.is_authorized("mallory", &key));
        assert!(AllowAll.is_authorized("mallory", &key));
        assert!(list.admits("carol"));
        assert!(!list.admits("mallory"));
        assert!(AllowAll.admits("mallory"));
    }
}
