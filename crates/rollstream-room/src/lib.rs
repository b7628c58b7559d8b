//! Room state for Rollstream: history, updates, and roster.
//!
//! # Key types
//!
//! - [`IdGenerator`]: mints strictly increasing, time-derived event ids
//! - [`EventLog`]: the append-only per-room history (append, read, range,
//!   edit, delete)
//! - [`UpdateChannel`]: fire-and-forget change notifications
//! - [`Roster`]: room existence and the players in it
//! - [`RoomConfig`]: retry bounds and page size
//!
//! Every type here is handed its [`Backend`](rollstream_store::Backend)
//! explicitly; nothing reaches for a global connection.

mod config;
mod error;
mod id;
mod log;
mod roster;
mod updates;

pub use config::RoomConfig;
pub use error::RoomError;
pub use id::IdGenerator;
pub use log::{EventLog, EventPage};
pub use roster::Roster;
pub use updates::UpdateChannel;
