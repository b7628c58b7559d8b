//! Integration tests for the room layer against the in-memory store.
//!
//! These exercise the pieces together: many writers appending at once,
//! edits racing each other, and the history/update channels seen from a
//! subscriber's point of view.

use std::sync::Arc;
use std::time::Duration;

use rollstream_protocol::{
    Event, EventDiff, EventId, EventKind, PlayerId, RoomId, Update, decode, encode_event,
};
use rollstream_room::{EventLog, IdGenerator, RoomConfig, RoomError};
use rollstream_store::{Backend, Bound, Clock, MemoryBackend, Subscription, keys};

// =========================================================================
// Helpers
// =========================================================================

fn event(id: EventId, player: &str, title: &str) -> Event {
    Event {
        id,
        player_id: PlayerId(player.into()),
        player_name: player.to_uppercase(),
        edited_at: 0,
        kind: EventKind::Roll {
            title: title.into(),
            dice: vec![1, 3, 5, 6],
            glitchy: 0,
        },
    }
}

fn shared_log(store: &MemoryBackend) -> Arc<EventLog<MemoryBackend>> {
    Arc::new(EventLog::new(
        store.clone(),
        Arc::new(IdGenerator::default()),
        RoomConfig::default(),
    ))
}

// =========================================================================
// Concurrent appends
// =========================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_one_entry_per_id_in_id_order() {
    let store = MemoryBackend::new();
    let log = shared_log(&store);
    let room = RoomId::new("g1");

    let mut tasks = Vec::new();
    for writer in 0..8 {
        let log = Arc::clone(&log);
        let room = room.clone();
        tasks.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for n in 0..25 {
                let title = format!("w{writer}-{n}");
                let appended = log
                    .append_new(&room, |id| event(id, "p", &title))
                    .await
                    .expect("append should succeed");
                ids.push(appended.id);
            }
            ids
        }));
    }

    let mut appended = Vec::new();
    for task in tasks {
        appended.extend(task.await.unwrap());
    }
    appended.sort();
    appended.dedup();
    assert_eq!(appended.len(), 200, "every append got a distinct id");

    let page = log
        .range(&room, Bound::Unbounded, Bound::Unbounded, 1_000)
        .await
        .unwrap();
    let mut listed: Vec<_> = page.events.iter().map(|e| e.id).collect();
    assert_eq!(listed.len(), 100, "page is capped at the default page size");
    assert!(listed.windows(2).all(|w| w[0] > w[1]), "newest first");
    listed.reverse();
    assert_eq!(&appended[100..], &listed[..]);
}

#[tokio::test]
async fn test_racing_fixed_id_appends_exactly_one_wins_and_one_publish() {
    let store = MemoryBackend::new();
    let log = shared_log(&store);
    let room = RoomId::new("g1");
    let mut sub = store.subscribe(&[keys::history("g1")]).await.unwrap();

    let mut tasks = Vec::new();
    for writer in 0..5 {
        let log = Arc::clone(&log);
        let room = room.clone();
        tasks.push(tokio::spawn(async move {
            log.append(&room, &event(EventId(42), &format!("p{writer}"), "race"))
                .await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => wins += 1,
            Err(RoomError::Conflict(EventId(42))) => conflicts += 1,
            Err(e) => panic!("unexpected error {e}"),
        }
    }
    assert_eq!((wins, conflicts), (1, 4));

    assert!(sub.recv(Duration::from_millis(50)).await.unwrap().is_some());
    assert!(sub.recv(Duration::from_millis(50)).await.unwrap().is_none());
}

// =========================================================================
// Round trips
// =========================================================================

#[tokio::test]
async fn test_appended_event_comes_back_verbatim_through_range() {
    let store = MemoryBackend::new();
    let log = shared_log(&store);
    let room = RoomId::new("g1");
    let original = event(EventId(1_700_000_000_000), "alice", "Perception");

    log.append(&room, &original).await.unwrap();
    let page = log
        .range(&room, Bound::Unbounded, Bound::Unbounded, 1)
        .await
        .unwrap();

    assert_eq!(page.events, vec![original.clone()]);
    let stored = log.get_raw(&room, original.id).await.unwrap();
    assert_eq!(stored, encode_event(&page.events[0]).unwrap());
}

// =========================================================================
// Edits
// =========================================================================

#[tokio::test]
async fn test_rename_in_room_g1_emits_exactly_one_update() {
    let store = MemoryBackend::new();
    let log = shared_log(&store);
    let room = RoomId::new("g1");
    log.append(&room, &event(EventId(1001), "alice", "Shoot")).await.unwrap();

    let mut sub = store.subscribe(&[keys::updates("g1")]).await.unwrap();
    let edited = log
        .update(&room, EventId(1001), &EventDiff::Title("Initiative".into()))
        .await
        .unwrap();

    let note = sub.recv(Duration::from_millis(50)).await.unwrap().unwrap();
    let update: Update = decode(&note.payload).unwrap();
    assert!(matches!(
        update,
        Update::EventRenamed { id: EventId(1001), ref title, edited_at }
            if title == "Initiative" && edited_at == edited.edited_at
    ));
    assert!(sub.recv(Duration::from_millis(50)).await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_edits_all_land_or_report_transient() {
    let store = MemoryBackend::new();
    let log = Arc::new(EventLog::new(
        store.clone(),
        Arc::new(IdGenerator::new(Clock::system())),
        RoomConfig { max_transaction_retries: 50, ..RoomConfig::default() },
    ));
    let room = RoomId::new("g1");
    log.append(
        &room,
        &Event {
            kind: EventKind::EdgeRoll {
                title: "edge".into(),
                rounds: vec![vec![6]],
                glitchy: 0,
            },
            ..event(EventId(1), "p", "unused")
        },
    )
    .await
    .unwrap();

    let mut tasks = Vec::new();
    for n in 0..10u8 {
        let log = Arc::clone(&log);
        let room = room.clone();
        tasks.push(tokio::spawn(async move {
            log.update(&room, EventId(1), &EventDiff::Reroll(vec![n])).await
        }));
    }
    let mut landed = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => landed += 1,
            Err(RoomError::Transient { .. }) => {}
            Err(e) => panic!("unexpected error {e}"),
        }
    }

    let stored = log.get_by_id(&room, EventId(1)).await.unwrap();
    let EventKind::EdgeRoll { rounds, .. } = stored.kind else {
        panic!("kind changed");
    };
    assert_eq!(rounds.len(), 1 + landed, "no lost updates");
}

#[tokio::test]
async fn test_subscriber_count_tracks_open_subscriptions() {
    let store = MemoryBackend::new();
    let channel = keys::history("g1");
    let sub = store.subscribe(&[channel.clone()]).await.unwrap();
    assert_eq!(store.subscriber_count(&channel).await.unwrap(), 1);
    drop(sub);
    assert_eq!(store.subscriber_count(&channel).await.unwrap(), 0);
}
