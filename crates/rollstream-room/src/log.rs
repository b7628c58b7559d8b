//! The per-room append-only event log.
//!
//! Each room's history is a sorted set scored by event id. Appending is a
//! conditional insert that publishes the event on the room's history
//! channel in the same atomic unit, so a subscriber never sees an event
//! that didn't make it into the log, and vice versa.
//!
//! Edits and deletes are compare-and-swap rewrites of one entry that also
//! publish an [`Update`]. A rewrite that loses a race is retried from a
//! fresh read a bounded number of times.

use std::sync::Arc;

use rollstream_protocol::{
    Event, EventDiff, EventId, RoomId, StoredEntry, Tombstone, Update, decode_entry,
    encode, encode_event, encode_update,
};
use rollstream_store::{Backend, Bound, CasOutcome, Publish, keys, with_retries};
use serde::Serialize;

use crate::{IdGenerator, RoomConfig, RoomError};

/// One page of a range query, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    /// True when the page was filled to the limit, so older entries may
    /// remain. Tombstones count toward the limit but are not returned.
    pub more: bool,
}

/// Reads and writes room histories.
pub struct EventLog<B: Backend> {
    backend: B,
    ids: Arc<IdGenerator>,
    config: RoomConfig,
}

impl<B: Backend> EventLog<B> {
    pub fn new(backend: B, ids: Arc<IdGenerator>, config: RoomConfig) -> Self {
        Self { backend, ids, config }
    }

    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    /// Appends `event` under its own id and publishes it on the room's
    /// history channel.
    ///
    /// # Errors
    /// [`RoomError::Conflict`] if any entry (live or deleted) already has
    /// this id. Nothing is written or published in that case.
    pub async fn append(&self, room: &RoomId, event: &Event) -> Result<(), RoomError> {
        let raw = encode_event(event)?;
        let key = keys::history(room.as_str());

        let inserted = self.backend.log_insert(&key, event.id.0, &raw, &key).await?;
        if !inserted {
            tracing::debug!(%room, id = %event.id, "event id already taken");
            return Err(RoomError::Conflict(event.id));
        }

        tracing::debug!(%room, id = %event.id, kind = event.kind.tag(), "event appended");
        Ok(())
    }

    /// Mints an id, builds the event with it and appends it, minting a new
    /// id whenever the previous one turns out to be taken.
    pub async fn append_new<F>(&self, room: &RoomId, build: F) -> Result<Event, RoomError>
    where
        F: Fn(EventId) -> Event,
    {
        let mut conflicts = 0;
        loop {
            let event = build(self.ids.next());
            match self.append(room, &event).await {
                Ok(()) => return Ok(event),
                Err(RoomError::Conflict(id)) if conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    tracing::warn!(%room, %id, conflicts, "event id collision, minting another");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the stored bytes of a live event exactly as written.
    ///
    /// # Errors
    /// [`RoomError::NotFound`] if the id is absent or deleted.
    pub async fn get_raw(&self, room: &RoomId, id: EventId) -> Result<String, RoomError> {
        let (raw, entry) = self.read_entry(room, id).await?;
        match entry {
            StoredEntry::Live(_) => Ok(raw),
            StoredEntry::Deleted(_) => Err(not_found(room, id)),
        }
    }

    /// Returns the live event with this id.
    ///
    /// # Errors
    /// [`RoomError::NotFound`] if the id is absent or deleted.
    pub async fn get_by_id(&self, room: &RoomId, id: EventId) -> Result<Event, RoomError> {
        let (_, entry) = self.read_entry(room, id).await?;
        entry.into_event().ok_or_else(|| not_found(room, id))
    }

    /// Events with `newest >= id >= oldest`, newest first.
    ///
    /// `limit` is clamped to `1..=max_page_size`.
    pub async fn range(
        &self,
        room: &RoomId,
        newest: Bound,
        oldest: Bound,
        limit: usize,
    ) -> Result<EventPage, RoomError> {
        let limit = limit.clamp(1, self.config.max_page_size.max(1));
        let key = keys::history(room.as_str());
        let raw = with_retries(self.config.store_retries, "log_range", || {
            self.backend.log_range(&key, newest, oldest, limit)
        })
        .await?;

        let more = raw.len() == limit;
        let mut events = Vec::with_capacity(raw.len());
        for entry in &raw {
            if let Some(event) = decode_entry(entry)?.into_event() {
                events.push(event);
            }
        }
        Ok(EventPage { events, more })
    }

    /// Applies `diff` to a live event, stamps its edit time, and publishes
    /// the matching update, all as one compare-and-swap.
    ///
    /// No authorization happens here; callers decide who may edit.
    ///
    /// # Errors
    /// - [`RoomError::NotFound`]: absent or deleted
    /// - [`RoomError::Protocol`]: the diff does not fit the event kind
    /// - [`RoomError::Transient`]: lost every race to concurrent writers
    pub async fn update(
        &self,
        room: &RoomId,
        id: EventId,
        diff: &EventDiff,
    ) -> Result<Event, RoomError> {
        self.rewrite(room, id, |mut event| {
            let edited_at = self.ids.next().0;
            event.apply(diff, edited_at)?;
            let message = encode_update(&Update::for_event_diff(id, diff, edited_at))?;
            let replacement = encode_event(&event)?;
            Ok((replacement, message, event))
        })
        .await
    }

    /// Replaces a live event with a tombstone and publishes
    /// `EventDeleted`. The id stays taken.
    pub async fn delete(&self, room: &RoomId, id: EventId) -> Result<Tombstone, RoomError> {
        self.rewrite(room, id, |_event| {
            let tombstone = Tombstone {
                id,
                deleted_at: self.ids.next().0,
            };
            let message = encode_update(&Update::EventDeleted { id })?;
            Ok((encode(&tombstone)?, message, tombstone))
        })
        .await
    }

    // -- Internals --------------------------------------------------------

    async fn read_entry(
        &self,
        room: &RoomId,
        id: EventId,
    ) -> Result<(String, StoredEntry), RoomError> {
        let key = keys::history(room.as_str());
        let raw = with_retries(self.config.store_retries, "log_get", || {
            self.backend.log_get(&key, id.0)
        })
        .await?
        .ok_or_else(|| not_found(room, id))?;
        let entry = decode_entry(&raw)?;
        Ok((raw, entry))
    }

    /// Compare-and-swap loop shared by `update` and `delete`.
    ///
    /// `prepare` turns the current live event into the replacement entry,
    /// the update message to publish, and the value to return.
    async fn rewrite<T, F>(&self, room: &RoomId, id: EventId, prepare: F) -> Result<T, RoomError>
    where
        F: Fn(Event) -> Result<(String, String, T), RoomError>,
    {
        let key = keys::history(room.as_str());
        let channel = keys::updates(room.as_str());
        let attempts = self.config.max_transaction_retries.max(1);

        for attempt in 1..=attempts {
            let (current, entry) = self.read_entry(room, id).await?;
            let event = entry.into_event().ok_or_else(|| not_found(room, id))?;
            let (replacement, message, output) = prepare(event)?;

            let publish = Publish { channel: &channel, message: &message };
            let outcome = with_retries(self.config.store_retries, "log_replace", || {
                self.backend.log_replace(&key, id.0, &current, &replacement, publish)
            })
            .await?;

            match outcome {
                CasOutcome::Replaced => {
                    tracing::debug!(%room, %id, "event rewritten");
                    return Ok(output);
                }
                CasOutcome::Missing => return Err(not_found(room, id)),
                CasOutcome::Stale => {
                    tracing::debug!(%room, %id, attempt, "event changed underneath, retrying");
                }
            }
        }

        tracing::warn!(%room, %id, attempts, "giving up on contended event");
        Err(RoomError::Transient { attempts })
    }
}

fn not_found(room: &RoomId, id: EventId) -> RoomError {
    RoomError::NotFound {
        room: room.clone(),
        id,
    }
}

#[cfg(test)]
mod tests {
    use rollstream_protocol::{EventKind, PlayerId};
    use rollstream_store::{Clock, MemoryBackend, Subscription};
    use std::time::Duration;

    use super::*;

    fn log(store: &MemoryBackend) -> EventLog<MemoryBackend> {
        EventLog::new(
            store.clone(),
            Arc::new(IdGenerator::new(Clock::starting_at(1_000_000))),
            RoomConfig::default(),
        )
    }

    fn roll(id: i64, title: &str) -> Event {
        Event {
            id: EventId(id),
            player_id: PlayerId("p1".into()),
            player_name: "Alice".into(),
            edited_at: 0,
            kind: EventKind::Roll {
                title: title.into(),
                dice: vec![2, 5, 6],
                glitchy: 0,
            },
        }
    }

    fn room() -> RoomId {
        RoomId::new("g1")
    }

    // =====================================================================
    // append()
    // =====================================================================

    #[tokio::test]
    async fn test_append_duplicate_id_returns_conflict() {
        let store = MemoryBackend::new();
        let log = log(&store);
        log.append(&room(), &roll(1001, "a")).await.unwrap();

        let err = log.append(&room(), &roll(1001, "b")).await.unwrap_err();
        assert!(matches!(err, RoomError::Conflict(EventId(1001))));
        assert_eq!(log.get_by_id(&room(), EventId(1001)).await.unwrap().kind, roll(0, "a").kind);
    }

    #[tokio::test]
    async fn test_append_publishes_full_event_on_history_channel() {
        let store = MemoryBackend::new();
        let log = log(&store);
        let mut sub = store.subscribe(&[keys::history("g1")]).await.unwrap();

        log.append(&room(), &roll(7, "a")).await.unwrap();
        let note = sub.recv(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(note.payload, encode_event(&roll(7, "a")).unwrap());
    }

    #[tokio::test]
    async fn test_append_new_retries_past_taken_id() {
        let store = MemoryBackend::new();
        let log = log(&store);
        // The generator's first id would be 1_000_000; occupy it.
        log.append(&room(), &roll(1_000_000, "squatter")).await.unwrap();

        let event = log
            .append_new(&room(), |id| roll(id.0, "fresh"))
            .await
            .unwrap();
        assert_eq!(event.id, EventId(1_000_001));
    }

    // =====================================================================
    // get_by_id() / get_raw()
    // =====================================================================

    #[tokio::test]
    async fn test_get_raw_twice_is_byte_identical() {
        let store = MemoryBackend::new();
        let log = log(&store);
        log.append(&room(), &roll(5, "same")).await.unwrap();

        let first = log.get_raw(&room(), EventId(5)).await.unwrap();
        let second = log.get_raw(&room(), EventId(5)).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_get_by_id_missing_returns_not_found() {
        let store = MemoryBackend::new();
        let err = log(&store).get_by_id(&room(), EventId(404)).await.unwrap_err();
        assert!(matches!(err, RoomError::NotFound { id: EventId(404), .. }));
    }

    #[tokio::test]
    async fn test_get_by_id_recovers_from_transient_read_error() {
        let store = MemoryBackend::new();
        let log = log(&store);
        log.append(&room(), &roll(5, "x")).await.unwrap();
        store.inject_failures(1);

        assert!(log.get_by_id(&room(), EventId(5)).await.is_ok());
    }

    // =====================================================================
    // range()
    // =====================================================================

    #[tokio::test]
    async fn test_range_unbounded_returns_all_newest_first() {
        let store = MemoryBackend::new();
        let log = log(&store);
        for id in [3, 1, 2] {
            log.append(&room(), &roll(id, "r")).await.unwrap();
        }

        let page = log
            .range(&room(), Bound::Unbounded, Bound::Unbounded, 10)
            .await
            .unwrap();
        let ids: Vec<_> = page.events.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert!(!page.more);
    }

    #[tokio::test]
    async fn test_range_full_page_sets_more() {
        let store = MemoryBackend::new();
        let log = log(&store);
        for id in 1..=5 {
            log.append(&room(), &roll(id, "r")).await.unwrap();
        }

        let page = log
            .range(&room(), Bound::Inclusive(4), Bound::Unbounded, 2)
            .await
            .unwrap();
        let ids: Vec<_> = page.events.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![4, 3]);
        assert!(page.more);
    }

    #[tokio::test]
    async fn test_range_limit_clamped_to_page_size() {
        let store = MemoryBackend::new();
        let log = EventLog::new(
            store.clone(),
            Arc::new(IdGenerator::default()),
            RoomConfig { max_page_size: 2, ..RoomConfig::default() },
        );
        for id in 1..=3 {
            log.append(&room(), &roll(id, "r")).await.unwrap();
        }
        let page = log
            .range(&room(), Bound::Unbounded, Bound::Unbounded, 50)
            .await
            .unwrap();
        assert_eq!(page.events.len(), 2);
        assert!(page.more);
    }

    #[tokio::test]
    async fn test_range_skips_tombstones_but_counts_them() {
        let store = MemoryBackend::new();
        let log = log(&store);
        for id in 1..=3 {
            log.append(&room(), &roll(id, "r")).await.unwrap();
        }
        log.delete(&room(), EventId(3)).await.unwrap();

        let page = log
            .range(&room(), Bound::Unbounded, Bound::Unbounded, 2)
            .await
            .unwrap();
        let ids: Vec<_> = page.events.iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![2]);
        assert!(page.more);
    }

    // =====================================================================
    // update() / delete()
    // =====================================================================

    #[tokio::test]
    async fn test_update_title_publishes_one_update_and_stamps_edit() {
        let store = MemoryBackend::new();
        let log = log(&store);
        log.append(&room(), &roll(1001, "Shoot")).await.unwrap();
        let mut sub = store.subscribe(&[keys::updates("g1")]).await.unwrap();

        let edited = log
            .update(&room(), EventId(1001), &EventDiff::Title("Initiative".into()))
            .await
            .unwrap();
        assert!(edited.edited_at > 0);

        let note = sub.recv(Duration::from_millis(50)).await.unwrap().unwrap();
        let update: Update = rollstream_protocol::decode(&note.payload).unwrap();
        assert_eq!(
            update,
            Update::EventRenamed {
                id: EventId(1001),
                title: "Initiative".into(),
                edited_at: edited.edited_at,
            }
        );
        assert!(sub.recv(Duration::from_millis(20)).await.unwrap().is_none());

        let stored = log.get_by_id(&room(), EventId(1001)).await.unwrap();
        assert_eq!(stored, edited);
    }

    #[tokio::test]
    async fn test_update_recovers_from_transient_write_error() {
        let store = MemoryBackend::new();
        let log = log(&store);
        log.append(&room(), &roll(1001, "Shoot")).await.unwrap();
        store.inject_failures_on("log_replace", 2);

        let edited = log
            .update(&room(), EventId(1001), &EventDiff::Title("Aim".into()))
            .await
            .unwrap();
        assert_eq!(log.get_by_id(&room(), EventId(1001)).await.unwrap(), edited);
    }

    #[tokio::test]
    async fn test_delete_recovers_from_transient_write_error() {
        let store = MemoryBackend::new();
        let log = log(&store);
        log.append(&room(), &roll(7, "Shoot")).await.unwrap();
        store.inject_failures_on("log_replace", 1);

        log.delete(&room(), EventId(7)).await.unwrap();
        let err = log.get_by_id(&room(), EventId(7)).await.unwrap_err();
        assert!(matches!(err, RoomError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_missing_event_returns_not_found() {
        let store = MemoryBackend::new();
        let err = log(&store)
            .update(&room(), EventId(1), &EventDiff::Title("x".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_invalid_diff_writes_nothing() {
        let store = MemoryBackend::new();
        let log = log(&store);
        log.append(&room(), &roll(1, "x")).await.unwrap();
        let before = log.get_raw(&room(), EventId(1)).await.unwrap();

        let err = log
            .update(&room(), EventId(1), &EventDiff::Reroll(vec![6]))
            .await
            .unwrap_err();
        assert!(matches!(err, RoomError::Protocol(_)));
        assert_eq!(log.get_raw(&room(), EventId(1)).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_delete_then_get_not_found_and_id_stays_taken() {
        let store = MemoryBackend::new();
        let log = log(&store);
        log.append(&room(), &roll(9, "x")).await.unwrap();

        log.delete(&room(), EventId(9)).await.unwrap();
        assert!(matches!(
            log.get_by_id(&room(), EventId(9)).await,
            Err(RoomError::NotFound { .. })
        ));
        assert!(matches!(
            log.append(&room(), &roll(9, "again")).await,
            Err(RoomError::Conflict(_))
        ));
        assert!(matches!(
            log.delete(&room(), EventId(9)).await,
            Err(RoomError::NotFound { .. })
        ));
    }
}
