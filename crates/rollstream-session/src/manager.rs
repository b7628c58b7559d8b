//! The session manager: issues, validates, pins and destroys sessions.
//!
//! Sessions live in the backing store as small hashes under
//! `session:<id>`, so any server process can validate any session.
//!
//! # Expiry
//!
//! An expiring session carries an explicit `expiresAt` stamp. The store
//! key itself is given a slightly longer TTL (`ttl + expiry_grace`), which
//! lets a lookup shortly after lapse tell "expired" apart from "never
//! existed".
//!
//! Pins are counted, one per attached stream. The first pin zeroes the
//! stamp and removes the key's TTL; the countdown restarts only when the
//! last pin is released, so a client that reconnects before its old
//! stream is torn down keeps its session. Both are "update only if it
//! still exists", so a session that was logged out can't be brought back
//! by a late pin.
//!
//! ```text
//! create() ──→ [Expiring] ──pin()──→ [Pinned n] ──unpin(), n = 1──→ [Expiring]
//!                  │                  │     ↑
//!                  │                  └─────┘ pin() / unpin(), n > 1
//!                  ▼ (ttl elapsed)
//!              Expired ──(grace elapsed)──→ NotFound
//! ```

use std::collections::HashMap;
use std::time::Duration;

use rollstream_protocol::{PlayerId, RoomId, SessionId};
use rollstream_store::{Backend, Clock, Hold, keys, with_retries};

use crate::{AuthEpoch, Session, SessionConfig, SessionError, SessionState};

const FIELD_ROOM: &str = "roomID";
const FIELD_PLAYER: &str = "playerID";
const FIELD_PLAYER_NAME: &str = "playerName";
const FIELD_EPOCH: &str = "epoch";
const FIELD_EXPIRES_AT: &str = "expiresAt";
const FIELD_PINS: &str = "pins";

/// Issues and validates sessions.
pub struct SessionManager<B: Backend> {
    backend: B,
    epoch: AuthEpoch<B>,
    clock: Clock,
    config: SessionConfig,
}

impl<B: Backend> SessionManager<B> {
    pub fn new(backend: B, clock: Clock, config: SessionConfig) -> Self {
        Self {
            epoch: AuthEpoch::new(backend.clone(), config.store_retries),
            backend,
            clock,
            config,
        }
    }

    pub fn epoch(&self) -> &AuthEpoch<B> {
        &self.epoch
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Issues a new expiring session for `player` in `room`.
    pub async fn create(
        &self,
        room: &RoomId,
        player: &PlayerId,
        player_name: &str,
    ) -> Result<Session, SessionError> {
        let epoch = self.epoch.current().await?;
        let id = SessionId::generate();
        let expires_at_ms = self.expiry_from_now();

        let fields = [
            (FIELD_ROOM, room.to_string()),
            (FIELD_PLAYER, player.to_string()),
            (FIELD_PLAYER_NAME, player_name.to_string()),
            (FIELD_EPOCH, epoch.to_string()),
            (FIELD_EXPIRES_AT, expires_at_ms.to_string()),
            (FIELD_PINS, "0".to_string()),
        ];
        let key = keys::session(id.as_str());
        let key_ttl = self.key_ttl();
        with_retries(self.config.store_retries, "session_create", || {
            self.backend.hash_create(&key, &fields, Some(key_ttl))
        })
        .await?;

        tracing::info!(%room, %player, "session created");
        Ok(Session {
            id,
            room: room.clone(),
            player_id: player.clone(),
            player_name: player_name.to_string(),
            epoch,
            state: SessionState::Expiring { expires_at_ms },
        })
    }

    /// Looks up and validates a session.
    ///
    /// # Errors
    /// - [`SessionError::NotFound`]: unknown, destroyed, or long gone
    /// - [`SessionError::Expired`]: lapsed within the grace window
    /// - [`SessionError::Revoked`]: issued before the current auth epoch
    pub async fn get(&self, id: &SessionId) -> Result<Session, SessionError> {
        let key = keys::session(id.as_str());
        let fields = with_retries(self.config.store_retries, "session_get", || {
            self.backend.hash_get_all(&key)
        })
        .await?;
        if fields.is_empty() {
            return Err(SessionError::NotFound);
        }

        let Some(session) = parse_session(id, &fields) else {
            tracing::warn!(?id, "malformed session record");
            return Err(SessionError::NotFound);
        };

        if session.epoch < self.epoch.current().await? {
            tracing::debug!(?id, epoch = session.epoch, "session from an old auth epoch");
            return Err(SessionError::Revoked);
        }
        if let SessionState::Expiring { expires_at_ms } = session.state {
            if self.clock.now_ms() >= expires_at_ms {
                return Err(SessionError::Expired);
            }
        }
        Ok(session)
    }

    /// Holds the session open while a stream is attached. Each call adds
    /// one pin; returns how many are now held.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the session no longer exists.
    pub async fn pin(&self, session: &Session) -> Result<u32, SessionError> {
        let pins = self.adjust_pins(session, 1).await?;
        tracing::debug!(player = %session.player_id, pins, "session pinned");
        Ok(pins)
    }

    /// Releases one pin. When none are left the session's normal expiry
    /// countdown restarts. Returns how many pins remain.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] if the session no longer exists.
    pub async fn unpin(&self, session: &Session) -> Result<u32, SessionError> {
        let pins = self.adjust_pins(session, -1).await?;
        tracing::debug!(player = %session.player_id, pins, "session unpinned");
        Ok(pins)
    }

    /// Deletes the session immediately, pinned or not. Returns whether it
    /// still existed.
    pub async fn destroy(&self, session: &Session) -> Result<bool, SessionError> {
        let key = keys::session(session.id.as_str());
        let existed = with_retries(self.config.store_retries, "session_destroy", || {
            self.backend.delete(&key)
        })
        .await?;
        tracing::info!(room = %session.room, player = %session.player_id, "session destroyed");
        Ok(existed)
    }

    // -- Internals --------------------------------------------------------

    fn expiry_from_now(&self) -> i64 {
        self.clock.now_ms() + self.config.ttl.as_millis() as i64
    }

    fn key_ttl(&self) -> Duration {
        self.config.ttl + self.config.expiry_grace
    }

    async fn adjust_pins(&self, session: &Session, delta: i64) -> Result<u32, SessionError> {
        let key = keys::session(session.id.as_str());
        let hold = Hold {
            count_field: FIELD_PINS,
            stamp_field: FIELD_EXPIRES_AT,
            release_stamp: self.expiry_from_now(),
            release_ttl: self.key_ttl(),
        };
        let pins = with_retries(self.config.store_retries, "session_pin", || {
            self.backend.hash_hold(&key, delta, hold)
        })
        .await?;
        match pins {
            Some(pins) => Ok(u32::try_from(pins).unwrap_or(0)),
            None => Err(SessionError::NotFound),
        }
    }
}

fn parse_session(id: &SessionId, fields: &HashMap<String, String>) -> Option<Session> {
    let expires_at_ms: i64 = fields.get(FIELD_EXPIRES_AT)?.parse().ok()?;
    let streams = fields
        .get(FIELD_PINS)
        .and_then(|pins| pins.parse().ok())
        .unwrap_or(0);
    let state = if expires_at_ms == 0 {
        SessionState::Pinned { streams }
    } else {
        SessionState::Expiring { expires_at_ms }
    };
    Some(Session {
        id: id.clone(),
        room: RoomId::new(fields.get(FIELD_ROOM)?.clone()),
        player_id: PlayerId(fields.get(FIELD_PLAYER)?.clone()),
        player_name: fields.get(FIELD_PLAYER_NAME)?.clone(),
        epoch: fields.get(FIELD_EPOCH)?.parse().ok()?,
        state,
    })
}

// =========================================================================
// Tests
// =========================================================================

#[cfg(test)]
mod tests {
    //! Unit tests for `SessionManager`, named
    //! `test_{function}_{scenario}_{expected}`.
    //!
    //! Expiry is driven by tokio's paused clock: `start_paused = true`
    //! freezes time and `tokio::time::advance` moves both the store's key
    //! deadlines and the manager's `Clock` forward together.

    use rollstream_store::MemoryBackend;

    use super::*;

    const TTL: Duration = Duration::from_secs(60);
    const GRACE: Duration = Duration::from_secs(10);

    // -- Helpers ----------------------------------------------------------

    fn manager(store: &MemoryBackend) -> SessionManager<MemoryBackend> {
        SessionManager::new(
            store.clone(),
            Clock::starting_at(1_700_000_000_000),
            SessionConfig {
                ttl: TTL,
                expiry_grace: GRACE,
                store_retries: 3,
            },
        )
    }

    async fn login(mgr: &SessionManager<MemoryBackend>) -> Session {
        mgr.create(&RoomId::new("g1"), &PlayerId("p1".into()), "Alice")
            .await
            .expect("create should succeed")
    }

    // =====================================================================
    // create() / get()
    // =====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_create_then_get_returns_same_session() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let created = login(&mgr).await;

        let fetched = mgr.get(&created.id).await.unwrap();
        assert_eq!(fetched, created);
        assert_eq!(fetched.player_name, "Alice");
        assert!(!fetched.is_pinned());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_each_session_gets_unique_id() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let a = login(&mgr).await;
        let b = login(&mgr).await;
        assert_ne!(a.id, b.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_unknown_id_returns_not_found() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let result = mgr.get(&SessionId::generate()).await;
        assert!(matches!(result, Err(SessionError::NotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_after_ttl_returns_expired_then_not_found() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let session = login(&mgr).await;

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(matches!(mgr.get(&session.id).await, Err(SessionError::Expired)));

        tokio::time::advance(GRACE).await;
        assert!(matches!(mgr.get(&session.id).await, Err(SessionError::NotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_recovers_from_transient_store_error() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let session = login(&mgr).await;
        store.inject_failures(1);

        assert!(mgr.get(&session.id).await.is_ok());
    }

    // =====================================================================
    // pin() / unpin()
    // =====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_pin_survives_well_past_ttl() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let session = login(&mgr).await;

        mgr.pin(&session).await.unwrap();
        tokio::time::advance(TTL * 5).await;

        let fetched = mgr.get(&session.id).await.unwrap();
        assert!(fetched.is_pinned());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpin_restarts_countdown() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let session = login(&mgr).await;
        mgr.pin(&session).await.unwrap();
        tokio::time::advance(TTL * 3).await;

        mgr.unpin(&session).await.unwrap();
        tokio::time::advance(TTL - Duration::from_secs(1)).await;
        assert!(mgr.get(&session.id).await.is_ok(), "still inside fresh ttl");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(mgr.get(&session.id).await, Err(SessionError::Expired)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpin_with_overlapping_pin_keeps_session_pinned() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let session = login(&mgr).await;

        assert_eq!(mgr.pin(&session).await.unwrap(), 1);
        assert_eq!(mgr.pin(&session).await.unwrap(), 2);
        assert_eq!(mgr.unpin(&session).await.unwrap(), 1);

        tokio::time::advance(TTL * 5).await;
        let fetched = mgr.get(&session.id).await.unwrap();
        assert_eq!(fetched.state, SessionState::Pinned { streams: 1 });

        assert_eq!(mgr.unpin(&session).await.unwrap(), 0);
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(matches!(mgr.get(&session.id).await, Err(SessionError::Expired)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpin_without_pin_leaves_count_at_zero() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let session = login(&mgr).await;

        assert_eq!(mgr.unpin(&session).await.unwrap(), 0);
        assert_eq!(mgr.pin(&session).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pin_after_destroy_returns_not_found_and_does_not_resurrect() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let session = login(&mgr).await;

        assert!(mgr.destroy(&session).await.unwrap());
        assert!(matches!(mgr.pin(&session).await, Err(SessionError::NotFound)));
        assert!(matches!(mgr.get(&session.id).await, Err(SessionError::NotFound)));
    }

    // =====================================================================
    // destroy()
    // =====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_destroy_pinned_session_removes_it() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let session = login(&mgr).await;
        mgr.pin(&session).await.unwrap();

        mgr.destroy(&session).await.unwrap();
        assert!(matches!(mgr.get(&session.id).await, Err(SessionError::NotFound)));
        assert!(!mgr.destroy(&session).await.unwrap(), "second destroy finds nothing");
    }

    // =====================================================================
    // auth epoch
    // =====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_bump_epoch_revokes_older_sessions_only() {
        let store = MemoryBackend::new();
        let mgr = manager(&store);
        let old = login(&mgr).await;

        mgr.epoch().bump().await.unwrap();
        assert!(matches!(mgr.get(&old.id).await, Err(SessionError::Revoked)));

        let fresh = login(&mgr).await;
        assert_eq!(fresh.epoch, 1);
        assert!(mgr.get(&fresh.id).await.is_ok());
    }
}
