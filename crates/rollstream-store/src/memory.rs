//! In-process [`Backend`] for tests and single-node use.
//!
//! All state sits behind one mutex, so every trait method is trivially a
//! single atomic unit. Expiry is lazy: a key past its deadline is dropped
//! the next time anything looks at it. Deadlines use the tokio clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::{
    Backend, Bound, CasOutcome, Hold, Notification, Publish, StoreError, Subscription,
};

#[derive(Debug)]
enum Value {
    Log(BTreeMap<i64, String>),
    Hash(HashMap<String, String>),
    Text(String),
    Counter(i64),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

struct Subscriber {
    channels: Vec<String>,
    tx: mpsc::UnboundedSender<Notification>,
}

#[derive(Default)]
struct State {
    keys: HashMap<String, Slot>,
    subscribers: HashMap<u64, Subscriber>,
    /// Number of upcoming operations that fail with `Unavailable`.
    injected_failures: usize,
    /// Per-operation counts of upcoming failures, keyed by method name.
    targeted_failures: HashMap<&'static str, usize>,
}

impl State {
    fn check_available(&mut self, operation: &'static str) -> Result<(), StoreError> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        if let Some(remaining) = self.targeted_failures.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::Unavailable(format!("injected {operation} failure")));
            }
        }
        Ok(())
    }

    /// Drops `key` if its deadline passed, then returns it.
    fn live(&mut self, key: &str) -> Option<&mut Slot> {
        let now = Instant::now();
        if self
            .keys
            .get(key)
            .is_some_and(|slot| slot.expires_at.is_some_and(|at| at <= now))
        {
            self.keys.remove(key);
        }
        self.keys.get_mut(key)
    }

    fn log(&mut self, key: &str) -> Result<Option<&mut BTreeMap<i64, String>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot { value: Value::Log(log), .. }) => Ok(Some(log)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn log_or_create(&mut self, key: &str) -> Result<&mut BTreeMap<i64, String>, StoreError> {
        if self.live(key).is_none() {
            self.keys.insert(
                key.to_string(),
                Slot { value: Value::Log(BTreeMap::new()), expires_at: None },
            );
        }
        self.log(key)?
            .ok_or_else(|| StoreError::WrongType(key.to_string()))
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut HashMap<String, String>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Slot { value: Value::Hash(hash), .. }) => Ok(Some(hash)),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    fn hash_or_create(&mut self, key: &str) -> Result<&mut HashMap<String, String>, StoreError> {
        if self.live(key).is_none() {
            self.keys.insert(
                key.to_string(),
                Slot { value: Value::Hash(HashMap::new()), expires_at: None },
            );
        }
        self.hash(key)?
            .ok_or_else(|| StoreError::WrongType(key.to_string()))
    }

    fn counter_slot(&mut self, key: &str) -> Result<&mut Slot, StoreError> {
        if self.live(key).is_none() {
            self.keys.insert(
                key.to_string(),
                Slot { value: Value::Counter(0), expires_at: None },
            );
        }
        match self.keys.get_mut(key) {
            Some(slot) if matches!(slot.value, Value::Counter(_)) => Ok(slot),
            _ => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Delivers `message` to every subscriber of `channel`.
    fn publish(&mut self, channel: &str, message: &str) -> usize {
        let mut delivered = 0;
        for sub in self.subscribers.values() {
            if sub.channels.iter().any(|c| c == channel) {
                let note = Notification {
                    channel: channel.to_string(),
                    payload: message.to_string(),
                };
                if sub.tx.send(note).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

struct Inner {
    state: Mutex<State>,
    next_subscriber: AtomicU64,
}

/// An in-memory backing store. Clones share the same state.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` operations fail with a transient error.
    pub fn inject_failures(&self, count: usize) {
        self.lock().injected_failures = count;
    }

    /// Makes the next `count` calls of the backend method named `operation`
    /// (for example `"log_insert"`) fail with a transient error. Other
    /// operations are unaffected.
    pub fn inject_failures_on(&self, operation: &'static str, count: usize) {
        self.lock().targeted_failures.insert(operation, count);
    }

    /// Ends every open subscription, as if the store dropped their
    /// connections.
    pub fn disconnect_subscribers(&self) {
        self.lock().subscribers.clear();
    }

    /// Number of open subscriptions across all channels.
    pub fn open_subscriptions(&self) -> usize {
        self.lock().subscribers.len()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    type Subscription = MemorySubscription;

    async fn log_insert(
        &self,
        key: &str,
        id: i64,
        entry: &str,
        channel: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        state.check_available("log_insert")?;
        let log = state.log_or_create(key)?;
        if log.contains_key(&id) {
            return Ok(false);
        }
        log.insert(id, entry.to_string());
        state.publish(channel, entry);
        Ok(true)
    }

    async fn log_get(&self, key: &str, id: i64) -> Result<Option<String>, StoreError> {
        let mut state = self.lock();
        state.check_available("log_get")?;
        Ok(state.log(key)?.and_then(|log| log.get(&id).cloned()))
    }

    async fn log_range(
        &self,
        key: &str,
        newest: Bound,
        oldest: Bound,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut state = self.lock();
        state.check_available("log_range")?;
        let Some(log) = state.log(key)? else {
            return Ok(Vec::new());
        };
        Ok(log
            .iter()
            .rev()
            .filter(|(score, _)| newest.admits_below(**score) && oldest.admits_above(**score))
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect())
    }

    async fn log_replace(
        &self,
        key: &str,
        id: i64,
        expected: &str,
        replacement: &str,
        publish: Publish<'_>,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.lock();
        state.check_available("log_replace")?;
        let Some(current) = state.log(key)?.and_then(|log| log.get_mut(&id)) else {
            return Ok(CasOutcome::Missing);
        };
        if current.as_str() != expected {
            return Ok(CasOutcome::Stale);
        }
        *current = replacement.to_string();
        state.publish(publish.channel, publish.message);
        Ok(CasOutcome::Replaced)
    }

    async fn hash_insert_nx(
        &self,
        key: &str,
        field: &str,
        value: &str,
        publish: Publish<'_>,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        state.check_available("hash_insert_nx")?;
        let hash = state.hash_or_create(key)?;
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_string());
        state.publish(publish.channel, publish.message);
        Ok(true)
    }

    async fn hash_replace(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        value: &str,
        publish: Publish<'_>,
    ) -> Result<CasOutcome, StoreError> {
        let mut state = self.lock();
        state.check_available("hash_replace")?;
        let Some(current) = state.hash(key)?.and_then(|hash| hash.get_mut(field)) else {
            return Ok(CasOutcome::Missing);
        };
        if current.as_str() != expected {
            return Ok(CasOutcome::Stale);
        }
        *current = value.to_string();
        state.publish(publish.channel, publish.message);
        Ok(CasOutcome::Replaced)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut state = self.lock();
        state.check_available("hash_get")?;
        Ok(state.hash(key)?.and_then(|hash| hash.get(field).cloned()))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut state = self.lock();
        state.check_available("hash_get_all")?;
        Ok(state.hash(key)?.map(|hash| hash.clone()).unwrap_or_default())
    }

    async fn hash_create(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.check_available("hash_create")?;
        let hash = fields
            .iter()
            .map(|(f, v)| (f.to_string(), v.clone()))
            .collect();
        state.keys.insert(
            key.to_string(),
            Slot {
                value: Value::Hash(hash),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn hash_hold(
        &self,
        key: &str,
        delta: i64,
        hold: Hold<'_>,
    ) -> Result<Option<i64>, StoreError> {
        let mut state = self.lock();
        state.check_available("hash_hold")?;
        let Some(slot) = state.live(key) else {
            return Ok(None);
        };
        let Value::Hash(hash) = &mut slot.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        let current: i64 = hash
            .get(hold.count_field)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0);
        let count = (current + delta).max(0);
        hash.insert(hold.count_field.to_string(), count.to_string());
        if count > 0 {
            hash.insert(hold.stamp_field.to_string(), "0".to_string());
            slot.expires_at = None;
        } else {
            hash.insert(hold.stamp_field.to_string(), hold.release_stamp.to_string());
            slot.expires_at = Some(Instant::now() + hold.release_ttl);
        }
        Ok(Some(count))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        state.check_available("exists")?;
        Ok(state.live(key).is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.lock();
        state.check_available("delete")?;
        let existed = state.live(key).is_some();
        state.keys.remove(key);
        Ok(existed)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.check_available("set")?;
        state.keys.insert(
            key.to_string(),
            Slot { value: Value::Text(value.to_string()), expires_at: None },
        );
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut state = self.lock();
        state.check_available("ttl")?;
        let now = Instant::now();
        Ok(state
            .live(key)
            .and_then(|slot| slot.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn counter_get(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.lock();
        state.check_available("counter_get")?;
        match state.live(key) {
            None => Ok(0),
            Some(Slot { value: Value::Counter(n), .. }) => Ok(*n),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    async fn counter_incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut state = self.lock();
        state.check_available("counter_incr")?;
        let slot = state.counter_slot(key)?;
        let Value::Counter(n) = &mut slot.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        *n += 1;
        Ok(*n)
    }

    async fn counter_incr_expiring(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut state = self.lock();
        state.check_available("counter_incr_expiring")?;
        let slot = state.counter_slot(key)?;
        slot.expires_at = Some(Instant::now() + ttl);
        let Value::Counter(n) = &mut slot.value else {
            return Err(StoreError::WrongType(key.to_string()));
        };
        *n += 1;
        Ok(*n)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        let mut state = self.lock();
        state.check_available("publish")?;
        Ok(state.publish(channel, message))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MemorySubscription, StoreError> {
        let mut state = self.lock();
        state.check_available("subscribe")?;
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.insert(
            id,
            Subscriber { channels: channels.to_vec(), tx },
        );
        tracing::debug!(subscriber = id, ?channels, "memory subscription opened");
        Ok(MemorySubscription {
            id,
            rx,
            inner: Arc::clone(&self.inner),
        })
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize, StoreError> {
        let mut state = self.lock();
        state.check_available("subscriber_count")?;
        Ok(state
            .subscribers
            .values()
            .filter(|sub| sub.channels.iter().any(|c| c == channel))
            .count())
    }
}

/// A subscription to a [`MemoryBackend`]. Unregisters itself on drop.
pub struct MemorySubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Notification>,
    inner: Arc<Inner>,
}

impl Subscription for MemorySubscription {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Notification>, StoreError> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Err(_elapsed) => Ok(None),
            Ok(Some(note)) => Ok(Some(note)),
            Ok(None) => Err(StoreError::Closed),
        }
    }

    async fn close(self) {
        drop(self);
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.subscribers.remove(&self.id).is_some() {
            tracing::debug!(subscriber = self.id, "memory subscription closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish<'a>(channel: &'a str, message: &'a str) -> Publish<'a> {
        Publish { channel, message }
    }

    // =====================================================================
    // log
    // =====================================================================

    #[tokio::test]
    async fn test_log_insert_same_score_twice_second_returns_false() {
        let store = MemoryBackend::new();
        assert!(store.log_insert("h", 5, "a", "h").await.unwrap());
        assert!(!store.log_insert("h", 5, "b", "h").await.unwrap());
        assert_eq!(store.log_get("h", 5).await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_log_insert_collision_publishes_nothing() {
        let store = MemoryBackend::new();
        let mut sub = store.subscribe(&["h".to_string()]).await.unwrap();
        store.log_insert("h", 5, "a", "h").await.unwrap();
        store.log_insert("h", 5, "b", "h").await.unwrap();

        let first = sub.recv(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.map(|n| n.payload).as_deref(), Some("a"));
        let second = sub.recv(Duration::from_millis(10)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_log_range_descending_within_bounds_and_limit() {
        let store = MemoryBackend::new();
        for id in 1..=6 {
            store.log_insert("h", id, &id.to_string(), "h").await.unwrap();
        }
        let page = store
            .log_range("h", Bound::Inclusive(5), Bound::Inclusive(2), 3)
            .await
            .unwrap();
        assert_eq!(page, vec!["5", "4", "3"]);
    }

    #[tokio::test]
    async fn test_log_range_missing_key_is_empty() {
        let store = MemoryBackend::new();
        let page = store
            .log_range("nothing", Bound::Unbounded, Bound::Unbounded, 10)
            .await
            .unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_log_replace_stale_and_missing() {
        let store = MemoryBackend::new();
        store.log_insert("h", 1, "v1", "h").await.unwrap();

        let stale = store.log_replace("h", 1, "old", "v2", publish("u", "m")).await.unwrap();
        assert_eq!(stale, CasOutcome::Stale);
        let missing = store.log_replace("h", 2, "v1", "v2", publish("u", "m")).await.unwrap();
        assert_eq!(missing, CasOutcome::Missing);
        let replaced = store.log_replace("h", 1, "v1", "v2", publish("u", "m")).await.unwrap();
        assert_eq!(replaced, CasOutcome::Replaced);
        assert_eq!(store.log_get("h", 1).await.unwrap().as_deref(), Some("v2"));
    }

    // =====================================================================
    // hashes and expiry
    // =====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_hash_create_with_ttl_expires() {
        let store = MemoryBackend::new();
        store
            .hash_create("s", &[("a", "1".into())], Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(store.exists("s").await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.exists("s").await.unwrap());
    }

    fn hold(release_stamp: i64) -> Hold<'static> {
        Hold {
            count_field: "holds",
            stamp_field: "until",
            release_stamp,
            release_ttl: Duration::from_secs(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hash_hold_persists_until_every_hold_released() {
        let store = MemoryBackend::new();
        store
            .hash_create("s", &[("until", "5".into())], Some(Duration::from_secs(10)))
            .await
            .unwrap();

        assert_eq!(store.hash_hold("s", 1, hold(7)).await.unwrap(), Some(1));
        assert_eq!(store.hash_hold("s", 1, hold(7)).await.unwrap(), Some(2));
        assert_eq!(store.ttl("s").await.unwrap(), None);
        assert_eq!(store.hash_get("s", "until").await.unwrap().as_deref(), Some("0"));

        assert_eq!(store.hash_hold("s", -1, hold(7)).await.unwrap(), Some(1));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(store.exists("s").await.unwrap(), "one hold remains");

        assert_eq!(store.hash_hold("s", -1, hold(9)).await.unwrap(), Some(0));
        assert_eq!(store.hash_get("s", "until").await.unwrap().as_deref(), Some("9"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_hold_release_below_zero_stays_at_zero() {
        let store = MemoryBackend::new();
        store.hash_create("s", &[("until", "1".into())], None).await.unwrap();
        assert_eq!(store.hash_hold("s", -1, hold(3)).await.unwrap(), Some(0));
        assert_eq!(store.hash_get("s", "holds").await.unwrap().as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_hash_hold_missing_key_does_not_create() {
        let store = MemoryBackend::new();
        assert_eq!(store.hash_hold("s", 1, hold(3)).await.unwrap(), None);
        assert!(!store.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_inject_failures_on_hits_only_named_operation() {
        let store = MemoryBackend::new();
        store.inject_failures_on("log_insert", 1);

        assert!(store.exists("k").await.is_ok());
        let err = store.log_insert("h", 1, "a", "c").await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.log_insert("h", 1, "a", "c").await.unwrap());
    }

    #[tokio::test]
    async fn test_hash_insert_nx_only_first_wins() {
        let store = MemoryBackend::new();
        assert!(store.hash_insert_nx("p", "f", "1", publish("u", "m")).await.unwrap());
        assert!(!store.hash_insert_nx("p", "f", "2", publish("u", "m")).await.unwrap());
        assert_eq!(store.hash_get("p", "f").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_wrong_type_reported() {
        let store = MemoryBackend::new();
        store.set("k", "text").await.unwrap();
        let err = store.hash_get("k", "f").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType(_)));
    }

    // =====================================================================
    // counters
    // =====================================================================

    #[tokio::test(start_paused = true)]
    async fn test_counter_incr_expiring_resets_after_ttl() {
        let store = MemoryBackend::new();
        let ttl = Duration::from_secs(10);
        assert_eq!(store.counter_incr_expiring("c", ttl).await.unwrap(), 1);
        assert_eq!(store.counter_incr_expiring("c", ttl).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.counter_get("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient_and_consumed() {
        let store = MemoryBackend::new();
        store.inject_failures(1);
        let err = store.counter_incr("c").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.counter_incr("c").await.unwrap(), 1);
    }

    // =====================================================================
    // pub/sub
    // =====================================================================

    #[tokio::test]
    async fn test_subscription_drop_unregisters() {
        let store = MemoryBackend::new();
        let sub = store.subscribe(&["c".to_string()]).await.unwrap();
        assert_eq!(store.subscriber_count("c").await.unwrap(), 1);

        sub.close().await;
        assert_eq!(store.subscriber_count("c").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_subscribers_recv_returns_closed() {
        let store = MemoryBackend::new();
        let mut sub = store.subscribe(&["c".to_string()]).await.unwrap();
        store.disconnect_subscribers();

        let err = sub.recv(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, StoreError::Closed));
    }

    #[tokio::test]
    async fn test_publish_reaches_only_matching_channel() {
        let store = MemoryBackend::new();
        let mut a = store.subscribe(&["a".to_string()]).await.unwrap();
        let mut b = store.subscribe(&["b".to_string()]).await.unwrap();

        assert_eq!(store.publish("a", "hello").await.unwrap(), 1);
        let got = a.recv(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(got.channel, "a");
        assert_eq!(got.payload, "hello");
        assert!(b.recv(Duration::from_millis(10)).await.unwrap().is_none());
    }
}
