//! Membership: peers believed reachable, plus what gossip taught us about them.
//!
//! Signing keys are kept for the life of the process, even after the peer
//! drops out of the online set. A key proven over a direct link by HELLO is
//! confirmed and never changes. A key that only arrived by gossip is
//! provisional: it verifies relayed traffic until the peer says HELLO itself,
//! and that HELLO's key wins.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::RwLock;
use trellis_core::PeerRecord;
use trellis_crypto::PeerKey;

use crate::authorizer::Authorizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinResult {
    /// First key seen for this peer.
    Pinned,
    /// Same key as already pinned.
    Unchanged,
    /// Replaced a different key that was only known from gossip.
    Replaced,
    /// A different key is already confirmed.
    Conflict,
}

#[derive(Debug, Clone, Copy)]
struct Pin {
    key: PeerKey,
    confirmed: bool,
}

#[derive(Debug, Default)]
pub struct Membership {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    online: BTreeSet<String>,
    addrs: HashMap<String, String>,
    keys: HashMap<String, Pin>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the peer was not already online.
    pub async fn add(&self, peer_id: &str) -> bool {
        self.inner.write().await.online.insert(peer_id.to_string())
    }

    pub async fn remove(&self, peer_id: &str) -> bool {
        self.inner.write().await.online.remove(peer_id)
    }

    pub async fn contains(&self, peer_id: &str) -> bool {
        self.inner.read().await.online.contains(peer_id)
    }

    /// Online peers, sorted.
    pub async fn list(&self) -> Vec<String> {
        self.inner.read().await.online.iter().cloned().collect()
    }

    /// Confirm `key` for `peer_id` after it was proven over a direct link.
    pub async fn pin_key(&self, peer_id: &str, key: PeerKey) -> PinResult {
        let mut inner = self.inner.write().await;
        let confirmed = Pin {
            key,
            confirmed: true,
        };
        match inner.keys.get_mut(peer_id) {
            Some(pin) if pin.key == key => {
                pin.confirmed = true;
                PinResult::Unchanged
            }
            Some(pin) if pin.confirmed => PinResult::Conflict,
            Some(pin) => {
                *pin = confirmed;
                PinResult::Replaced
            }
            None => {
                inner.keys.insert(peer_id.to_string(), confirmed);
                PinResult::Pinned
            }
        }
    }

    pub async fn key(&self, peer_id: &str) -> Option<PeerKey> {
        self.inner.read().await.keys.get(peer_id).map(|pin| pin.key)
    }

    /// Remember the dialable address a peer advertised.
    pub async fn learn_addr(&self, peer_id: &str, addr: &str) {
        self.inner
            .write()
            .await
            .addrs
            .insert(peer_id.to_string(), addr.to_string());
    }

    pub async fn addr(&self, peer_id: &str) -> Option<String> {
        self.inner.read().await.addrs.get(peer_id).cloned()
    }

    /// Merge gossiped records, skipping `self_id`.
    ///
    /// Returns the ids that became online and the ids that were refused:
    /// unparseable keys, keys that disagree with one already held, and peers
    /// `authorizer` would not admit. Refused records are otherwise ignored.
    pub async fn merge(
        &self,
        records: &[PeerRecord],
        self_id: &str,
        authorizer: &dyn Authorizer,
    ) -> MergeReport {
        let mut report = MergeReport::default();
        let mut inner = self.inner.write().await;

        for record in records {
            if record.peer_id == self_id {
                continue;
            }
            if !authorizer.admits(&record.peer_id) {
                report.rejected.push(record.peer_id.clone());
                continue;
            }

            if let Some(encoded) = &record.signing_key {
                let key = match PeerKey::parse(encoded) {
                    Ok(key) if authorizer.is_authorized(&record.peer_id, &key) => key,
                    _ => {
                        report.rejected.push(record.peer_id.clone());
                        continue;
                    }
                };
                match inner.keys.get(&record.peer_id) {
                    Some(pin) if pin.key != key => {
                        report.rejected.push(record.peer_id.clone());
                        continue;
                    }
                    Some(_) => {}
                    None => {
                        inner.keys.insert(
                            record.peer_id.clone(),
                            Pin {
                                key,
                                confirmed: false,
                            },
                        );
                    }
                }
            }

            if let Some(addr) = &record.addr {
                inner
                    .addrs
                    .entry(record.peer_id.clone())
                    .or_insert_with(|| addr.clone());
            }
            if inner.online.insert(record.peer_id.clone()) {
                report.added.push(record.peer_id.clone());
            }
        }
        report
    }

    /// Records for every online peer, with whatever address and key we hold.
    pub async fn records(&self) -> Vec<PeerRecord> {
        let inner = self.inner.read().await;
        inner
            .online
            .iter()
            .map(|id| PeerRecord {
                peer_id: id.clone(),
                addr: inner.addrs.get(id).cloned(),
                signing_key: inner.keys.get(id).map(|pin| pin.key.encode()),
            })
            .collect()
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub added: Vec<String>,
    pub rejected: Vec<String>,
}
