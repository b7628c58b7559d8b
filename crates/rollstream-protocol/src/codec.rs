//! JSON encoding for everything that is stored in or published through
//! the backing store.
//!
//! Events and updates are stored and published as JSON text. Keeping the
//! conversions here means every crate reports bad bytes the same way,
//! as a [`ProtocolError`].

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{Event, ProtocolError, StoredEntry, Update};

/// Serializes any wire value to a JSON string.
pub fn encode<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(value).map_err(ProtocolError::Encode)
}

/// Parses a JSON string into any wire value.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, ProtocolError> {
    serde_json::from_str(raw).map_err(ProtocolError::Decode)
}

pub fn encode_event(event: &Event) -> Result<String, ProtocolError> {
    encode(event)
}

pub fn encode_update(update: &Update) -> Result<String, ProtocolError> {
    encode(update)
}

/// Decodes a raw log entry, which may be a tombstone.
pub fn decode_entry(raw: &str) -> Result<StoredEntry, ProtocolError> {
    decode(raw)
}
