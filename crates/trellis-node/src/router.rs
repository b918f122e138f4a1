//! Overlay router: the session table and flood/unicast delivery.
//!
//! Every envelope passes the seen-set exactly once; a repeat is dropped
//! before any lookup. Flooded envelopes go to every verified session except
//! the originator's and the one they arrived on. Sends to different sessions
//! run concurrently; the table lock is released before any write starts.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use trellis_core::Envelope;

use crate::seen::SeenSet;
use crate::session::Session;

/// What `route` did with an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The message id was already seen.
    Duplicate,
    /// Written to this many sessions.
    Sent(usize),
    /// Unicast with no session for the receiver.
    NoRoute,
}

pub struct Router {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    seen: SeenSet,
}

impl Router {
    pub fn new(seen_window: Duration, seen_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            seen: SeenSet::new(seen_window, seen_capacity),
        }
    }

    /// Register `session` under `id`. A different session already holding
    /// the id is displaced and closed.
    pub async fn add_session(&self, id: &str, session: Arc<Session>) {
        session.set_peer_id(id);
        let displaced = self.sessions.write().await.insert(id.to_string(), session.clone());
        if let Some(old) = displaced {
            if !Arc::ptr_eq(&old, &session) {
                info!(peer = %id, old_conn = old.conn_id(), new_conn = session.conn_id(), "session replaced");
                old.close();
            }
        }
    }

    /// Remove and close the session registered under `id`.
    pub async fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().await.remove(id);
        if let Some(session) = &removed {
            session.close();
            debug!(peer = %id, "session removed");
        }
        removed
    }

    /// Remove `session` only if it is still the one registered under its id.
    /// Returns the id it was removed from.
    pub async fn remove_if_current(&self, session: &Arc<Session>) -> Option<String> {
        let mut sessions = self.sessions.write().await;
        let id = session.peer_id();
        let current = sessions
            .get(&id)
            .map(|s| Arc::ptr_eq(s, session))
            .unwrap_or(false);
        session.close();
        if current {
            sessions.remove(&id);
            Some(id)
        } else {
            None
        }
    }

    /// Atomically move the session under `old` to `new`.
    ///
    /// Any other session already registered as `new` is displaced and closed.
    /// Returns `false` if nothing is registered under `old`.
    pub async fn rekey(&self, old: &str, new: &str) -> bool {
        if old == new {
            return self.sessions.read().await.contains_key(old);
        }

        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions.remove(old) else {
            return false;
        };
        session.set_peer_id(new);
        if let Some(displaced) = sessions.insert(new.to_string(), session.clone()) {
            info!(peer = %new, old_conn = displaced.conn_id(), new_conn = session.conn_id(), "session replaced");
            displaced.close();
        }
        debug!(from = %old, to = %new, "session rekeyed");
        true
    }

    pub async fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Whether a verified session exists for `id`.
    pub async fn is_connected(&self, id: &str) -> bool {
        self.sessions
            .read()
            .await
            .get(id)
            .map(|s| s.is_verified() && !s.is_closed())
            .unwrap_or(false)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Close and drop every session.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close();
        }
    }

    /// Deliver a locally originated envelope. Never touches the TTL.
    pub async fn route(&self, envelope: &Envelope) -> RouteOutcome {
        self.deliver(envelope, None).await
    }

    /// Deliver an envelope received on `via`, never sending it back there.
    pub async fn forward(&self, envelope: &Envelope, via: &Arc<Session>) -> RouteOutcome {
        self.deliver(envelope, Some(via)).await
    }

    async fn deliver(&self, envelope: &Envelope, via: Option<&Arc<Session>>) -> RouteOutcome {
        if !self.seen.insert(&envelope.message_id).await {
            debug!(msg = %envelope.message_id, "duplicate dropped");
            return RouteOutcome::Duplicate;
        }

        let targets: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().await;
            if envelope.is_flooded() {
                sessions
                    .iter()
                    .filter(|(id, _)| **id != envelope.sender_id)
                    .map(|(_, s)| s)
                    .filter(|s| via.map_or(true, |v| !Arc::ptr_eq(s, v)))
                    .filter(|s| s.is_verified())
                    .cloned()
                    .collect()
            } else {
                match sessions.get(&envelope.receiver_id) {
                    Some(s) if s.is_verified() && via.map_or(true, |v| !Arc::ptr_eq(s, v)) => {
                        vec![s.clone()]
                    }
                    _ => Vec::new(),
                }
            }
        };

        if targets.is_empty() && !envelope.is_flooded() {
            warn!(
                msg = %envelope.message_id,
                receiver = %envelope.receiver_id,
                kind = %envelope.kind,
                "no route"
            );
            return RouteOutcome::NoRoute;
        }

        let results = join_all(targets.iter().map(|s| s.send(envelope))).await;
        let mut sent = 0;
        for (session, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = %session.peer_id(), msg = %envelope.message_id, "send failed: {}", e),
            }
        }
        debug!(msg = %envelope.message_id, kind = %envelope.kind, sent, "routed");
        RouteOutcome::Sent(sent)
    }
}
