//! Updates: fire-and-forget notifications that something already in a
//! room changed.
//!
//! Inside Rust an update is a tagged enum. On the wire it is a short
//! positional JSON array, because that is what clients already parse:
//!
//! ```text
//! ["event", 1001, {"title": "Initiative"}, 1700000000123]   rename
//! ["event", 1001, {"reroll": [1, 6]}, 1700000000123]        reroll
//! ["event", 1001, "del"]                                    delete
//! ["player", "a1b2..", {"name": "Zed", "hue": 40}]          player diff
//! ["player", "add", {"id": "..", "name": "..", "hue": 0}]   player joined
//! ```
//!
//! The positional format lives only in the `Serialize`/`Deserialize`
//! impls below; nothing else in the workspace indexes into arrays.

use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{EventDiff, EventId, PlayerDiff, PlayerId, PlayerInfo};

const TY_EVENT: &str = "event";
const TY_PLAYER: &str = "player";
const DELETE_MARKER: &str = "del";
const ADD_MARKER: &str = "add";

/// A change notification published on a room's update channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    EventRenamed {
        id: EventId,
        title: String,
        edited_at: i64,
    },
    EventRerolled {
        id: EventId,
        round: Vec<u8>,
        edited_at: i64,
    },
    EventDeleted {
        id: EventId,
    },
    PlayerAttributeChanged {
        id: PlayerId,
        diff: PlayerDiff,
    },
    PlayerJoined {
        info: PlayerInfo,
    },
}

impl Update {
    /// The update that announces `diff` having been applied to event `id`.
    pub fn for_event_diff(id: EventId, diff: &EventDiff, edited_at: i64) -> Self {
        match diff {
            EventDiff::Title(title) => Update::EventRenamed {
                id,
                title: title.clone(),
                edited_at,
            },
            EventDiff::Reroll(round) => Update::EventRerolled {
                id,
                round: round.clone(),
                edited_at,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Serialize
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct TitleBody<'a> {
    title: &'a str,
}

#[derive(Serialize)]
struct RerollBody<'a> {
    reroll: &'a [u8],
}

impl Serialize for Update {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Update::EventRenamed { id, title, edited_at } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element(TY_EVENT)?;
                seq.serialize_element(id)?;
                seq.serialize_element(&TitleBody { title })?;
                seq.serialize_element(edited_at)?;
                seq.end()
            }
            Update::EventRerolled { id, round, edited_at } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element(TY_EVENT)?;
                seq.serialize_element(id)?;
                seq.serialize_element(&RerollBody { reroll: round })?;
                seq.serialize_element(edited_at)?;
                seq.end()
            }
            Update::EventDeleted { id } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(TY_EVENT)?;
                seq.serialize_element(id)?;
                seq.serialize_element(DELETE_MARKER)?;
                seq.end()
            }
            Update::PlayerAttributeChanged { id, diff } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(TY_PLAYER)?;
                seq.serialize_element(id)?;
                seq.serialize_element(diff)?;
                seq.end()
            }
            Update::PlayerJoined { info } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(TY_PLAYER)?;
                seq.serialize_element(ADD_MARKER)?;
                seq.serialize_element(info)?;
                seq.end()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Deserialize
// ---------------------------------------------------------------------------

/// Third element of an `"event"` update: either the delete marker or a
/// one-field diff object.
#[derive(Deserialize)]
#[serde(untagged)]
enum EventBody {
    Marker(String),
    Diff {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        reroll: Option<Vec<u8>>,
    },
}

struct UpdateVisitor;

impl<'de> Visitor<'de> for UpdateVisitor {
    type Value = Update;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an update array such as [\"event\", id, diff, time]")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Update, A::Error> {
        let ty: String = seq
            .next_element()?
            .ok_or_else(|| de::Error::invalid_length(0, &self))?;

        match ty.as_str() {
            TY_EVENT => {
                let id: EventId = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let body: EventBody = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                match body {
                    EventBody::Marker(m) if m == DELETE_MARKER => Ok(Update::EventDeleted { id }),
                    EventBody::Marker(m) => Err(de::Error::invalid_value(
                        de::Unexpected::Str(&m),
                        &"\"del\"",
                    )),
                    EventBody::Diff { title, reroll } => {
                        let edited_at: i64 = seq
                            .next_element()?
                            .ok_or_else(|| de::Error::invalid_length(3, &self))?;
                        match (title, reroll) {
                            (Some(title), None) => Ok(Update::EventRenamed { id, title, edited_at }),
                            (None, Some(round)) => Ok(Update::EventRerolled { id, round, edited_at }),
                            _ => Err(de::Error::custom(
                                "event diff must carry exactly one of title or reroll",
                            )),
                        }
                    }
                }
            }
            TY_PLAYER => {
                let who: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                if who == ADD_MARKER {
                    let info: PlayerInfo = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                    Ok(Update::PlayerJoined { info })
                } else {
                    let diff: PlayerDiff = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                    Ok(Update::PlayerAttributeChanged { id: PlayerId(who), diff })
                }
            }
            other => Err(de::Error::unknown_variant(other, &[TY_EVENT, TY_PLAYER])),
        }
    }
}

impl<'de> Deserialize<'de> for Update {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_seq(UpdateVisitor)
    }
}
