//! Event id generation.

use std::sync::atomic::{AtomicI64, Ordering};

use rollstream_protocol::EventId;
use rollstream_store::Clock;

/// Mints event ids from the current time in milliseconds.
///
/// Ids from one generator are strictly increasing, even when many tasks
/// call [`next`](Self::next) within the same millisecond: each id is
/// `max(now, last + 1)`. Two processes can still mint the same id; the
/// event log's conditional insert turns that into a `Conflict`.
#[derive(Debug)]
pub struct IdGenerator {
    last: AtomicI64,
    clock: Clock,
}

impl IdGenerator {
    pub fn new(clock: Clock) -> Self {
        Self {
            last: AtomicI64::new(0),
            clock,
        }
    }

    /// Returns a fresh id, strictly greater than any previously returned.
    pub fn next(&self) -> EventId {
        let now = self.clock.now_ms();
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(last + 1);
            match self.last.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return EventId(candidate),
                Err(actual) => last = actual,
            }
        }
    }

    /// The most recently minted id, or `EventId(0)` before the first.
    pub fn current(&self) -> EventId {
        EventId(self.last.load(Ordering::Acquire))
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(Clock::system())
    }
}
