//! Bounded set of processed message ids.
//!
//! Entries expire after the replay window: an envelope older than the window
//! is already rejected by its timestamp, so its id no longer needs tracking.
//! The capacity cap evicts the oldest ids first when a burst outruns expiry.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct SeenSet {
    inner: Mutex<SeenInner>,
    window: Duration,
    capacity: usize,
}

#[derive(Debug, Default)]
struct SeenInner {
    ids: HashSet<String>,
    order: VecDeque<(Instant, String)>,
}

impl SeenSet {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(SeenInner::default()),
            window,
            capacity: capacity.max(1),
        }
    }

    /// Record `id`. Returns `true` only for the first caller.
    pub async fn insert(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.evict(now, self.window, self.capacity);

        if inner.ids.contains(id) {
            return false;
        }
        inner.ids.insert(id.to_string());
        inner.order.push_back((now, id.to_string()));
        true
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.lock().await.ids.contains(id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.ids.len()
    }
}

impl SeenInner {
    fn evict(&mut self, now: Instant, window: Duration, capacity: usize) {
        while let Some((at, _)) = self.order.front() {
            let expired = now.duration_since(*at) > window;
            if !expired && self.order.len() < capacity {
                break;
            }
            if let Some((_, id)) = self.order.pop_front() {
                self.ids.remove(&id);
            }
        }
    }
}
