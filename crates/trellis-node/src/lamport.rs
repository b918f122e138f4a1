use std::sync::atomic::{AtomicI64, Ordering};

/// Lamport logical clock shared by every connection task of a node.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicI64,
}

impl LamportClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local send and return the stamp to use.
    ///
    /// Saturates at `i64::MAX`.
    pub fn tick(&self) -> i64 {
        self.advance(|local| local.saturating_add(1))
    }

    /// Merge a received stamp: `local = max(local, received) + 1`.
    pub fn observe(&self, received: i64) -> i64 {
        self.advance(|local| local.max(received).saturating_add(1))
    }

    fn advance(&self, step: impl Fn(i64) -> i64) -> i64 {
        match self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |local| Some(step(local)))
        {
            Ok(previous) | Err(previous) => step(previous),
        }
    }

    pub fn current(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn tick_increments_before_stamping() {
        let clock = LamportClock::new();
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.current(), 2);
    }

    #[test]
    fn observe_takes_max_plus_one() {
        let clock = LamportClock::new();
        clock.tick();
        assert_eq!(clock.observe(10), 11);
        assert_eq!(clock.observe(3), 12);
        assert_eq!(clock.current(), 12);
    }

    #[test]
    fn clock_saturates_at_the_top() {
        let clock = LamportClock::new();
        assert_eq!(clock.observe(i64::MAX), i64::MAX);
        assert_eq!(clock.tick(), i64::MAX);
        assert_eq!(clock.tick(), i64::MAX);
        assert_eq!(clock.observe(5), i64::MAX);
        assert_eq!(clock.current(), i64::MAX);
    }

    #[test]
    fn concurrent_ticks_are_never_lost() {
        let clock = Arc::new(LamportClock::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        clock.tick();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(clock.current(), 8_000);
    }
}
