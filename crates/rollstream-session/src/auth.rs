//! The global auth epoch.
//!
//! Every session records the epoch that was current when it was created.
//! Bumping the epoch revokes all existing sessions at once without having
//! to find and delete them: the next lookup of an older session fails
//! with [`SessionError::Revoked`](crate::SessionError::Revoked).

use rollstream_store::{Backend, keys, with_retries};

use crate::SessionError;

#[derive(Clone)]
pub struct AuthEpoch<B: Backend> {
    backend: B,
    store_retries: u32,
}

impl<B: Backend> AuthEpoch<B> {
    pub fn new(backend: B, store_retries: u32) -> Self {
        Self { backend, store_retries }
    }

    /// The current epoch; 0 until the first bump.
    pub async fn current(&self) -> Result<i64, SessionError> {
        Ok(with_retries(self.store_retries, "auth_epoch", || {
            self.backend.counter_get(keys::AUTH_EPOCH)
        })
        .await?)
    }

    /// Advances the epoch, revoking every session issued before now.
    /// Returns the new epoch.
    pub async fn bump(&self) -> Result<i64, SessionError> {
        let epoch = self.backend.counter_incr(keys::AUTH_EPOCH).await?;
        tracing::warn!(epoch, "auth epoch bumped, existing sessions revoked");
        Ok(epoch)
    }
}
