//! Wire types for Rollstream.
//!
//! This crate defines what is stored in a room's log and what travels
//! over its channels:
//!
//! - **Identifiers** ([`RoomId`], [`PlayerId`], [`EventId`], [`SessionId`]).
//! - **Events** ([`Event`], [`EventKind`]) and their edits ([`EventDiff`]),
//!   plus [`Tombstone`]s left behind by deletion.
//! - **Updates** ([`Update`]), the change notifications pushed to clients.
//! - **Codec** functions converting all of the above to and from JSON.
//!
//! It knows nothing about the backing store or HTTP. Higher layers hand
//! it values and get strings back, or the other way round.

mod codec;
mod error;
mod event;
mod ids;
mod update;

pub use codec::{decode, decode_entry, encode, encode_event, encode_update};
pub use error::ProtocolError;
pub use event::{
    Event, EventDiff, EventKind, PlayerDiff, PlayerInfo, StoredEntry, Tombstone,
};
pub use ids::{EventId, PlayerId, RoomId, SessionId};
pub use update::Update;
