//! Error types for the room layer.

use rollstream_protocol::{EventId, PlayerId, ProtocolError, RoomId};
use rollstream_store::StoreError;

/// Errors that can occur reading or writing a room's state.
#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    /// No live event with this id. Deleted events report this too.
    #[error("event {id} not found in room {room}")]
    NotFound { room: RoomId, id: EventId },

    /// The room does not exist.
    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    /// Another entry already holds this event id. Nothing was written or
    /// published; retry with a fresh id.
    #[error("event id {0} is already taken")]
    Conflict(EventId),

    /// The player is already on the room's roster.
    #[error("player {0} already in room {1}")]
    PlayerExists(PlayerId, RoomId),

    /// The player is not on the room's roster.
    #[error("player {0} not in room {1}")]
    PlayerNotFound(PlayerId, RoomId),

    /// Every compare-and-swap attempt lost to a concurrent writer.
    #[error("write abandoned after {attempts} conflicting attempts")]
    Transient { attempts: u32 },

    /// Bad stored bytes, or a diff that does not fit its event.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
