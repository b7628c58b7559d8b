//! The per-room update channel.

use rollstream_protocol::{RoomId, Update, encode_update};
use rollstream_store::{Backend, keys};

use crate::RoomError;

/// Publishes change notifications for rooms.
///
/// Updates are fire-and-forget: they are never stored, and a client that
/// is not subscribed when one goes out never sees it. Clients that need
/// the current state re-read the event log.
#[derive(Clone)]
pub struct UpdateChannel<B: Backend> {
    backend: B,
}

impl<B: Backend> UpdateChannel<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Publishes `update` on the room's update channel, returning how many
    /// subscribers received it.
    pub async fn publish(&self, room: &RoomId, update: &Update) -> Result<usize, RoomError> {
        let message = encode_update(update)?;
        let receivers = self
            .backend
            .publish(&keys::updates(room.as_str()), &message)
            .await?;
        tracing::trace!(%room, receivers, "update published");
        Ok(receivers)
    }
}
