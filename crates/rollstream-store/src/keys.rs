//! Key and channel naming.
//!
//! A room's history is both a sorted-set key and a channel of the same
//! name; subscribers get each appended event in full on that channel.

/// Sorted log of a room's events, and the channel new events go out on.
pub fn history(room: &str) -> String {
    format!("history:{room}")
}

/// Channel for a room's change notifications.
pub fn updates(room: &str) -> String {
    format!("update:{room}")
}

/// Marker key whose existence means the room exists.
pub fn game(room: &str) -> String {
    format!("game:{room}")
}

/// Hash of player id to player info for a room.
pub fn players(room: &str) -> String {
    format!("players:{room}")
}

pub fn session(id: &str) -> String {
    format!("session:{id}")
}

/// Global counter sessions are stamped with; bumping it revokes them all.
pub const AUTH_EPOCH: &str = "auth_version";

/// Per-origin request counter for one rate-limit window.
pub fn rate_limit(origin: &str, window: i64) -> String {
    format!("ratelimit:{origin}:{window}")
}
