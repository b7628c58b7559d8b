//! Error types for the session layer.

use rollstream_store::StoreError;

/// Errors that can occur looking up or changing a session.
///
/// `NotFound`, `Expired` and `Revoked` all mean "log in again". They are
/// kept apart for logging; the HTTP layer shows clients the same response
/// for all three.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No such session: never issued, logged out, or long expired.
    #[error("session not found")]
    NotFound,

    /// The session lapsed recently and has not been swept yet.
    #[error("session expired")]
    Expired,

    /// The session predates the current auth epoch.
    #[error("session revoked")]
    Revoked,

    /// The backing store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}
