// Copyright 2026 Branch Mesh Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};

/// A Lamport logical clock.
///
/// Every outgoing message carries [`LamportClock::tick`]; every incoming
/// message must call [`LamportClock::update`] with the sender's timestamp
/// before the handler looks at the payload. The clock is a single atomic
/// counter — there is no ambient/module-level state, it is always owned by
/// a node and threaded explicitly into whatever subsystem needs to tag a
/// message.
#[derive(Debug, Default)]
pub struct LamportClock {
    value: AtomicU64,
}

impl LamportClock {
    /// Creates a clock starting at zero.
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Atomically increments the clock and returns the new value.
    pub fn tick(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Atomically sets the clock to `max(clock, received_ts) + 1`.
    pub fn update(&self, received_ts: u64) -> u64 {
        let mut current = self.value.load(Ordering::SeqCst);
        loop {
            let next = current.max(received_ts) + 1;
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    /// Reads the current value without mutating it.
    pub fn peek(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_is_strictly_increasing() {
        let clock = LamportClock::new();
        let a = clock.tick();
        let b = clock.tick();
        let c = clock.tick();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn update_takes_the_max_plus_one() {
        let clock = LamportClock::new();
        clock.tick(); // 1
        clock.tick(); // 2
        let updated = clock.update(10);
        assert_eq!(updated, 11);
        assert_eq!(clock.peek(), 11);

        // A stale timestamp still advances the clock by one.
        let updated = clock.update(3);
        assert_eq!(updated, 12);
    }

    #[test]
    fn update_then_tick_round_trip_is_strictly_increasing() {
        let clock = LamportClock::new();
        let mut last = clock.peek();
        for received in [0, 5, 5, 2, 100] {
            let t = clock.update(received);
            assert!(t > last);
            last = t;
            let t = clock.tick();
            assert!(t > last);
            last = t;
        }
    }

    #[test]
    fn peek_does_not_mutate() {
        let clock = LamportClock::new();
        clock.tick();
        let before = clock.peek();
        let after = clock.peek();
        assert_eq!(before, after);
    }
}
