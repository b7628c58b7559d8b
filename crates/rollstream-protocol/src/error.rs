//! Error types for the protocol layer.

/// Errors raised while converting wire values or applying diffs.
///
/// A `ProtocolError` always means the bytes or the requested change are
/// wrong, never that the network or the store misbehaved.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Stored or published bytes could not be parsed.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// A diff does not fit the event it targets.
    #[error("invalid diff: {0}")]
    InvalidDiff(String),
}
