//! Events: the immutable-ish records that make up a room's history.
//!
//! An event is created once and appended to the room log. After that it
//! can only change through an [`EventDiff`] (which also stamps the edit
//! time) or be replaced by a [`Tombstone`] when deleted.
//!
//! Field names on the wire are short (`pID`, `pName`, `edit`, `ty`)
//! because every event is stored and re-sent many times.

use serde::{Deserialize, Serialize};

use crate::{EventId, PlayerId, ProtocolError};

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// One entry in a room's history.
///
/// The `kind` is flattened so the JSON looks like
/// `{"id":1,"pID":"..","pName":"..","edit":0,"ty":"roll","title":"..",...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    #[serde(rename = "pID")]
    pub player_id: PlayerId,

    #[serde(rename = "pName")]
    pub player_name: String,

    /// Unix milliseconds of the last edit, or 0 if never edited.
    #[serde(rename = "edit", default)]
    pub edited_at: i64,

    #[serde(flatten)]
    pub kind: EventKind,
}

/// The closed set of event kinds and their payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "ty")]
pub enum EventKind {
    /// A plain pool of dice.
    #[serde(rename = "roll")]
    Roll {
        title: String,
        dice: Vec<u8>,
        glitchy: i32,
    },

    /// A pool rolled with exploding sixes. Each round is one explosion.
    #[serde(rename = "edgeRoll")]
    EdgeRoll {
        title: String,
        rounds: Vec<Vec<u8>>,
        glitchy: i32,
    },

    /// The failed dice of an earlier roll, rolled again.
    #[serde(rename = "rerollFailures")]
    RerollFailures {
        #[serde(rename = "prevID")]
        prev_id: EventId,
        title: String,
        rounds: Vec<Vec<u8>>,
        glitchy: i32,
    },

    /// Initiative: a flat base plus a handful of dice.
    #[serde(rename = "initiativeRoll")]
    InitiativeRoll {
        title: String,
        base: i32,
        dice: Vec<u8>,
    },

    /// A player joined the room.
    #[serde(rename = "playerJoin")]
    PlayerJoin,
}

impl EventKind {
    /// The wire tag of this kind (`"roll"`, `"edgeRoll"`, ...).
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::Roll { .. } => "roll",
            EventKind::EdgeRoll { .. } => "edgeRoll",
            EventKind::RerollFailures { .. } => "rerollFailures",
            EventKind::InitiativeRoll { .. } => "initiativeRoll",
            EventKind::PlayerJoin => "playerJoin",
        }
    }

    fn title_mut(&mut self) -> Option<&mut String> {
        match self {
            EventKind::Roll { title, .. }
            | EventKind::EdgeRoll { title, .. }
            | EventKind::RerollFailures { title, .. }
            | EventKind::InitiativeRoll { title, .. } => Some(title),
            EventKind::PlayerJoin => None,
        }
    }

    fn rounds_mut(&mut self) -> Option<&mut Vec<Vec<u8>>> {
        match self {
            EventKind::EdgeRoll { rounds, .. }
            | EventKind::RerollFailures { rounds, .. } => Some(rounds),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// EventDiff
// ---------------------------------------------------------------------------

/// A change to an existing event's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventDiff {
    /// Replace the title.
    Title(String),
    /// Append another round of dice (second chance on a multi-round roll).
    Reroll(Vec<u8>),
}

impl Event {
    /// Applies `diff` to this event and stamps `edited_at`.
    ///
    /// # Errors
    /// [`ProtocolError::InvalidDiff`] when the event's kind has no field
    /// the diff could change (e.g. retitling a `playerJoin`).
    pub fn apply(&mut self, diff: &EventDiff, edited_at: i64) -> Result<(), ProtocolError> {
        let tag = self.kind.tag();
        match diff {
            EventDiff::Title(new_title) => {
                let title = self.kind.title_mut().ok_or_else(|| {
                    ProtocolError::InvalidDiff(format!("{tag} has no title"))
                })?;
                *title = new_title.clone();
            }
            EventDiff::Reroll(round) => {
                let rounds = self.kind.rounds_mut().ok_or_else(|| {
                    ProtocolError::InvalidDiff(format!("{tag} has no rounds"))
                })?;
                rounds.push(round.clone());
            }
        }
        self.edited_at = edited_at;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tombstone / StoredEntry
// ---------------------------------------------------------------------------

/// What remains of a deleted event. It keeps the id occupied in the log
/// so the id is never minted again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tombstone {
    pub id: EventId,
    /// Unix milliseconds of deletion.
    #[serde(rename = "del")]
    pub deleted_at: i64,
}

/// A raw log entry, which is either a live event or a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredEntry {
    Deleted(Tombstone),
    Live(Event),
}

impl StoredEntry {
    pub fn id(&self) -> EventId {
        match self {
            StoredEntry::Deleted(t) => t.id,
            StoredEntry::Live(e) => e.id,
        }
    }

    pub fn into_event(self) -> Option<Event> {
        match self {
            StoredEntry::Live(e) => Some(e),
            StoredEntry::Deleted(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Players
// ---------------------------------------------------------------------------

/// What other players in a room can see about a player.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub id: PlayerId,
    pub name: String,
    /// Display hue in degrees, `0..360`.
    pub hue: i32,
}

impl PlayerInfo {
    /// Player names are 1 to 32 characters with no line breaks.
    pub fn valid_name(name: &str) -> bool {
        let len = name.chars().count();
        (1..=32).contains(&len) && !name.contains(['\r', '\n'])
    }
}

/// A partial change to a player's visible attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerDiff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hue: Option<i32>,
}

impl PlayerDiff {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.hue.is_none()
    }

    /// Applies the diff to `info` in place.
    pub fn apply_to(&self, info: &mut PlayerInfo) {
        if let Some(name) = &self.name {
            info.name = name.clone();
        }
        if let Some(hue) = self.hue {
            info.hue = hue;
        }
    }
}
