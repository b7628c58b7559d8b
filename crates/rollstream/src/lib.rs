//! # Rollstream
//!
//! Real-time backbone for multiplayer dice rooms.
//!
//! Rollstream keeps an append-only event log per room in a Redis-compatible
//! store, fans every change out to connected clients over server-sent
//! events, and issues session credentials whose expiry is paused while the
//! client is streaming.
//!
//! ## Layers
//!
//! ```text
//! HTTP routes / SSE (this crate)   ← login, rolls, edits, subscription
//!     ↕
//! rollstream-session               ← sessions, pin/unpin, auth epoch
//! rollstream-room                  ← event log, updates, roster
//! rollstream-bridge                ← pub/sub → per-client queue
//!     ↕
//! rollstream-store                 ← Redis or in-memory backend
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rollstream::prelude::*;
//!
//! # async fn run() -> Result<(), RollstreamError> {
//! let server = RollstreamServerBuilder::new()
//!     .bind("0.0.0.0:3001")
//!     .seed_rooms(["test1"])
//!     .build(MemoryBackend::new())
//!     .await?;
//! server.run().await
//! # }
//! ```

mod config;
pub mod dice;
mod error;
pub mod handler;
pub mod logging;
pub mod rate_limit;
mod server;
pub mod sse;

pub use config::{DiceConfig, LogConfig, RateLimitConfig, ServerConfig, StreamConfig};
pub use error::{REAUTHENTICATE, RollstreamError};
pub use server::{RollstreamServer, RollstreamServerBuilder, ServerState, router};

/// Everything needed to run a server, in one import.
pub mod prelude {
    pub use crate::{
        DiceConfig, LogConfig, RateLimitConfig, RollstreamError, RollstreamServer,
        RollstreamServerBuilder, ServerConfig, ServerState, StreamConfig, router,
    };
    pub use rollstream_bridge::{Bridge, BridgeConfig, BridgeMessage, BridgeState, CloseReason};
    pub use rollstream_protocol::{
        Event, EventDiff, EventId, EventKind, PlayerDiff, PlayerId, PlayerInfo, RoomId,
        SessionId, Update,
    };
    pub use rollstream_room::{EventLog, EventPage, IdGenerator, RoomConfig, RoomError, Roster};
    pub use rollstream_session::{
        AuthEpoch, Session, SessionConfig, SessionError, SessionManager, SessionState,
    };
    #[cfg(feature = "redis")]
    pub use rollstream_store::RedisBackend;
    pub use rollstream_store::{Backend, Bound, Clock, MemoryBackend, StoreError};
}
