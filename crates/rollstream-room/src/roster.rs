//! Room existence and the room's player roster.
//!
//! A room exists while its `game:` key exists. Its players live in a
//! hash of player id to [`PlayerInfo`] JSON; joins and attribute changes
//! publish an [`Update`] in the same atomic unit as the write.

use rollstream_protocol::{
    PlayerDiff, PlayerId, PlayerInfo, RoomId, Update, decode, encode, encode_update,
};
use rollstream_store::{Backend, CasOutcome, Publish, keys, with_retries};

use crate::{RoomConfig, RoomError};

pub struct Roster<B: Backend> {
    backend: B,
    config: RoomConfig,
}

impl<B: Backend> Roster<B> {
    pub fn new(backend: B, config: RoomConfig) -> Self {
        Self { backend, config }
    }

    pub async fn exists(&self, room: &RoomId) -> Result<bool, RoomError> {
        let key = keys::game(room.as_str());
        Ok(with_retries(self.config.store_retries, "room_exists", || {
            self.backend.exists(&key)
        })
        .await?)
    }

    /// Marks the room as existing. Creating an existing room is a no-op.
    pub async fn create_room(&self, room: &RoomId) -> Result<(), RoomError> {
        self.backend.set(&keys::game(room.as_str()), room.as_str()).await?;
        tracing::info!(%room, "room created");
        Ok(())
    }

    /// Adds a player and publishes `PlayerJoined`.
    ///
    /// # Errors
    /// - [`RoomError::RoomNotFound`] if the room doesn't exist
    /// - [`RoomError::PlayerExists`] if the id is already on the roster
    pub async fn add_player(&self, room: &RoomId, info: &PlayerInfo) -> Result<(), RoomError> {
        if !self.exists(room).await? {
            return Err(RoomError::RoomNotFound(room.clone()));
        }

        let value = encode(info)?;
        let message = encode_update(&Update::PlayerJoined { info: info.clone() })?;
        let channel = keys::updates(room.as_str());
        let added = self
            .backend
            .hash_insert_nx(
                &keys::players(room.as_str()),
                info.id.as_str(),
                &value,
                Publish { channel: &channel, message: &message },
            )
            .await?;

        if !added {
            return Err(RoomError::PlayerExists(info.id.clone(), room.clone()));
        }
        tracing::info!(%room, player = %info.id, name = %info.name, "player joined");
        Ok(())
    }

    /// All players in the room, ordered by name then id.
    pub async fn players(&self, room: &RoomId) -> Result<Vec<PlayerInfo>, RoomError> {
        let key = keys::players(room.as_str());
        let raw = with_retries(self.config.store_retries, "roster", || {
            self.backend.hash_get_all(&key)
        })
        .await?;

        let mut players = raw
            .values()
            .map(|value| decode::<PlayerInfo>(value))
            .collect::<Result<Vec<_>, _>>()?;
        players.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(players)
    }

    pub async fn player(&self, room: &RoomId, player: &PlayerId) -> Result<PlayerInfo, RoomError> {
        let (_, info) = self.read_player(room, player).await?;
        Ok(info)
    }

    /// Applies `diff` to a player's info and publishes
    /// `PlayerAttributeChanged`, as one compare-and-swap.
    pub async fn update_player(
        &self,
        room: &RoomId,
        player: &PlayerId,
        diff: &PlayerDiff,
    ) -> Result<PlayerInfo, RoomError> {
        let key = keys::players(room.as_str());
        let channel = keys::updates(room.as_str());
        let message = encode_update(&Update::PlayerAttributeChanged {
            id: player.clone(),
            diff: diff.clone(),
        })?;
        let attempts = self.config.max_transaction_retries.max(1);

        for attempt in 1..=attempts {
            let (current, mut info) = self.read_player(room, player).await?;
            diff.apply_to(&mut info);
            let value = encode(&info)?;

            let outcome = self
                .backend
                .hash_replace(
                    &key,
                    player.as_str(),
                    &current,
                    &value,
                    Publish { channel: &channel, message: &message },
                )
                .await?;
            match outcome {
                CasOutcome::Replaced => {
                    tracing::debug!(%room, %player, "player updated");
                    return Ok(info);
                }
                CasOutcome::Missing => {
                    return Err(RoomError::PlayerNotFound(player.clone(), room.clone()));
                }
                CasOutcome::Stale => {
                    tracing::debug!(%room, %player, attempt, "player changed underneath, retrying");
                }
            }
        }
        Err(RoomError::Transient { attempts })
    }

    async fn read_player(
        &self,
        room: &RoomId,
        player: &PlayerId,
    ) -> Result<(String, PlayerInfo), RoomError> {
        let key = keys::players(room.as_str());
        let raw = with_retries(self.config.store_retries, "player", || {
            self.backend.hash_get(&key, player.as_str())
        })
        .await?
        .ok_or_else(|| RoomError::PlayerNotFound(player.clone(), room.clone()))?;
        let info = decode(&raw)?;
        Ok((raw, info))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rollstream_store::{MemoryBackend, Subscription};

    use super::*;

    fn info(id: &str, name: &str) -> PlayerInfo {
        PlayerInfo {
            id: PlayerId(id.into()),
            name: name.into(),
            hue: 120,
        }
    }

    async fn roster_with_room(store: &MemoryBackend) -> Roster<MemoryBackend> {
        let roster = Roster::new(store.clone(), RoomConfig::default());
        roster.create_room(&RoomId::new("g1")).await.unwrap();
        roster
    }

    #[tokio::test]
    async fn test_add_player_missing_room_returns_room_not_found() {
        let store = MemoryBackend::new();
        let roster = Roster::new(store, RoomConfig::default());
        let err = roster
            .add_player(&RoomId::new("nope"), &info("a", "Ann"))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::RoomNotFound(_)));
    }

    #[tokio::test]
    async fn test_add_player_publishes_player_joined() {
        let store = MemoryBackend::new();
        let roster = roster_with_room(&store).await;
        let mut sub = store.subscribe(&[keys::updates("g1")]).await.unwrap();

        roster.add_player(&RoomId::new("g1"), &info("a", "Ann")).await.unwrap();

        let note = sub.recv(Duration::from_millis(50)).await.unwrap().unwrap();
        let update: Update = decode(&note.payload).unwrap();
        assert_eq!(update, Update::PlayerJoined { info: info("a", "Ann") });
    }

    #[tokio::test]
    async fn test_add_player_twice_returns_player_exists() {
        let store = MemoryBackend::new();
        let roster = roster_with_room(&store).await;
        let room = RoomId::new("g1");
        roster.add_player(&room, &info("a", "Ann")).await.unwrap();

        let err = roster.add_player(&room, &info("a", "Ann")).await.unwrap_err();
        assert!(matches!(err, RoomError::PlayerExists(..)));
    }

    #[tokio::test]
    async fn test_players_sorted_by_name() {
        let store = MemoryBackend::new();
        let roster = roster_with_room(&store).await;
        let room = RoomId::new("g1");
        roster.add_player(&room, &info("b", "Zed")).await.unwrap();
        roster.add_player(&room, &info("a", "Ann")).await.unwrap();

        let names: Vec<_> = roster
            .players(&room)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(names, vec!["Ann", "Zed"]);
    }

    #[tokio::test]
    async fn test_update_player_applies_diff_and_publishes() {
        let store = MemoryBackend::new();
        let roster = roster_with_room(&store).await;
        let room = RoomId::new("g1");
        roster.add_player(&room, &info("a", "Ann")).await.unwrap();
        let mut sub = store.subscribe(&[keys::updates("g1")]).await.unwrap();

        let diff = PlayerDiff { name: Some("Annie".into()), hue: None };
        let updated = roster
            .update_player(&room, &PlayerId("a".into()), &diff)
            .await
            .unwrap();
        assert_eq!(updated.name, "Annie");
        assert_eq!(updated.hue, 120);

        let note = sub.recv(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(note.payload, r#"["player","a",{"name":"Annie"}]"#);
    }

    #[tokio::test]
    async fn test_update_player_unknown_returns_player_not_found() {
        let store = MemoryBackend::new();
        let roster = roster_with_room(&store).await;
        let err = roster
            .update_player(&RoomId::new("g1"), &PlayerId("ghost".into()), &PlayerDiff::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::PlayerNotFound(..)));
    }
}
