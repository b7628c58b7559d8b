//! Session types.
//!
//! A session is the server's record of one logged-in player in one room.
//! Its id is the bearer credential the client presents on every request.

use std::time::Duration;

use rollstream_protocol::{PlayerId, RoomId, SessionId};

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Configuration for session lifetimes.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an unpinned session stays valid after creation or unpin.
    ///
    /// Default: 15 minutes.
    pub ttl: Duration,

    /// How long a lapsed session is still recognised (and reported as
    /// expired rather than unknown) before the store drops it.
    ///
    /// Default: 60 seconds.
    pub expiry_grace: Duration,

    /// Attempts for store operations that fail transiently.
    pub store_retries: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15 * 60),
            expiry_grace: Duration::from_secs(60),
            store_retries: 3,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

/// Whether the session is counting down or held open by a live stream.
///
/// ```text
///   Expiring ──(pin)──→ Pinned
///       ↑                  │
///       └──(last unpin)────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Valid until `expires_at_ms` (unix milliseconds).
    Expiring { expires_at_ms: i64 },

    /// Held open by `streams` attached streams. Never expires on its own.
    Pinned { streams: u32 },
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A logged-in player's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// The bearer credential. Redacted in `Debug` output.
    pub id: SessionId,
    pub room: RoomId,
    pub player_id: PlayerId,
    pub player_name: String,
    /// Auth epoch at creation; the session is revoked once the global
    /// epoch moves past it.
    pub epoch: i64,
    pub state: SessionState,
}

impl Session {
    pub fn is_pinned(&self) -> bool {
        matches!(self.state, SessionState::Pinned { .. })
    }
}
