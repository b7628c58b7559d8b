//! Unified error type for the Rollstream server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rollstream_bridge::BridgeError;
use rollstream_protocol::ProtocolError;
use rollstream_room::RoomError;
use rollstream_session::SessionError;
use rollstream_store::StoreError;

/// Body of every authentication failure, whatever the cause.
pub const REAUTHENTICATE: &str = "please re-authenticate";

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` attribute on each variant auto-generates `From` impls,
/// so the `?` operator converts sub-crate errors automatically. The
/// remaining variants originate in the HTTP layer itself.
#[derive(Debug, thiserror::Error)]
pub enum RollstreamError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// No credential was presented.
    #[error("missing session")]
    MissingSession,

    /// The request is malformed or out of range.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller is authenticated but may not do this.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The caller's origin is over its request ceiling.
    #[error("rate limited")]
    RateLimited,

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RollstreamError {
    /// The HTTP status this error is reported with.
    ///
    /// Unknown, expired and revoked sessions, and sessions whose room has
    /// gone, all map to the same `401` so clients cannot tell them apart.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingSession => StatusCode::UNAUTHORIZED,
            Self::Session(SessionError::Store(e)) | Self::Store(e) => store_status(e),
            Self::Session(_) => StatusCode::UNAUTHORIZED,
            Self::Room(e) => match e {
                RoomError::RoomNotFound(_) => StatusCode::UNAUTHORIZED,
                RoomError::NotFound { .. } | RoomError::PlayerNotFound(..) => {
                    StatusCode::NOT_FOUND
                }
                RoomError::Conflict(_) | RoomError::PlayerExists(..) => StatusCode::CONFLICT,
                RoomError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
                RoomError::Protocol(ProtocolError::InvalidDiff(_)) => StatusCode::BAD_REQUEST,
                RoomError::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
                RoomError::Store(e) => store_status(e),
            },
            Self::Protocol(ProtocolError::InvalidDiff(_)) => StatusCode::BAD_REQUEST,
            Self::Protocol(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Bridge(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Logging(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

fn store_status(e: &StoreError) -> StatusCode {
    if e.is_transient() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for RollstreamError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match status {
            StatusCode::UNAUTHORIZED => {
                tracing::debug!(error = %self, "rejecting credentials");
                REAUTHENTICATE.to_string()
            }
            StatusCode::INTERNAL_SERVER_ERROR => {
                tracing::error!(error = %self, "request failed");
                "internal error".to_string()
            }
            StatusCode::SERVICE_UNAVAILABLE => {
                tracing::warn!(error = %self, "request failed transiently");
                "temporarily unavailable, try again".to_string()
            }
            _ => self.to_string(),
        };
        (status, body).into_response()
    }
}
