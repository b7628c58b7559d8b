//! Wall-clock milliseconds that follow the tokio clock.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// A millisecond clock anchored to the wall clock at construction and
/// advanced by [`tokio::time::Instant`].
///
/// Event ids, session expiry stamps and rate-limit windows all read time
/// from a `Clock`. Because it advances with tokio's clock, tests that call
/// `tokio::time::pause()` / `advance()` move it deterministically.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor_ms: i64,
    anchor: Instant,
}

impl Clock {
    /// A clock anchored to the current system time.
    pub fn system() -> Self {
        let anchor_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Self::starting_at(anchor_ms)
    }

    /// A clock that reads `anchor_ms` right now.
    pub fn starting_at(anchor_ms: i64) -> Self {
        Self {
            anchor_ms,
            anchor: Instant::now(),
        }
    }

    /// Milliseconds since the unix epoch.
    pub fn now_ms(&self) -> i64 {
        self.anchor_ms + self.anchor.elapsed().as_millis() as i64
    }

    /// Whole seconds since the unix epoch.
    pub fn now_secs(&self) -> i64 {
        self.now_ms().div_euclid(1000)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_ms_advances_with_tokio_clock() {
        let clock = Clock::starting_at(1_000);
        assert_eq!(clock.now_ms(), 1_000);

        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(clock.now_ms(), 1_250);
        assert_eq!(clock.now_secs(), 1);
    }

    #[test]
    fn test_system_clock_is_after_2020() {
        assert!(Clock::system().now_ms() > 1_577_836_800_000);
    }
}
