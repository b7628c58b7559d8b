//! Backing-store abstraction for Rollstream.
//!
//! Everything Rollstream persists or broadcasts goes through the
//! [`Backend`] trait: a sorted log per room, small hashes (sessions,
//! rosters), counters, and publish/subscribe channels. Each method is one
//! atomic unit in the store, so callers never have to stitch together a
//! "write then publish" pair themselves.
//!
//! Two implementations ship here:
//!
//! - [`MemoryBackend`]: in-process, used by tests and single-node demos.
//!   Key expiry follows the tokio clock, so paused-time tests work.
//! - [`RedisBackend`] (feature `redis`, on by default): any
//!   Redis-compatible server. Conditional writes run as Lua scripts.
//!
//! # Feature Flags
//!
//! - `redis` (default): the Redis backend via the `redis` crate.

mod clock;
mod error;
pub mod keys;
mod memory;
#[cfg(feature = "redis")]
mod redis_backend;
mod retry;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

pub use clock::Clock;
pub use error::StoreError;
pub use memory::{MemoryBackend, MemorySubscription};
#[cfg(feature = "redis")]
pub use redis_backend::{RedisBackend, RedisSubscription};
pub use retry::with_retries;

// ---------------------------------------------------------------------------
// Bound
// ---------------------------------------------------------------------------

/// One end of a score range over a sorted log.
///
/// `Unbounded` is the explicit "no limit on this side" sentinel; it maps
/// to `+inf` on the newest end and `-inf` on the oldest end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bound {
    #[default]
    Unbounded,
    Inclusive(i64),
}

impl Bound {
    /// Whether `score` is at or below this bound when used as an upper end.
    pub fn admits_below(&self, score: i64) -> bool {
        match self {
            Bound::Unbounded => true,
            Bound::Inclusive(max) => score <= *max,
        }
    }

    /// Whether `score` is at or above this bound when used as a lower end.
    pub fn admits_above(&self, score: i64) -> bool {
        match self {
            Bound::Unbounded => true,
            Bound::Inclusive(min) => score >= *min,
        }
    }
}

/// A bound string that is not empty, not an integer, and not the
/// infinity belonging to its end of the range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid range bound {0:?}")]
pub struct ParseBoundError(pub String);

impl Bound {
    /// Parses the newest (upper) end: empty, `+inf`, or an integer.
    pub fn parse_newest(s: &str) -> Result<Self, ParseBoundError> {
        Self::parse_with(s, "+inf")
    }

    /// Parses the oldest (lower) end: empty, `-inf`, or an integer.
    pub fn parse_oldest(s: &str) -> Result<Self, ParseBoundError> {
        Self::parse_with(s, "-inf")
    }

    fn parse_with(s: &str, infinity: &str) -> Result<Self, ParseBoundError> {
        match s.trim() {
            "" => Ok(Bound::Unbounded),
            t if t == infinity => Ok(Bound::Unbounded),
            t => t
                .parse::<i64>()
                .map(Bound::Inclusive)
                .map_err(|_| ParseBoundError(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications and compare-and-swap outcomes
// ---------------------------------------------------------------------------

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Result of a conditional replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The current value matched and was replaced; the message was published.
    Replaced,
    /// Nothing is stored there.
    Missing,
    /// Something else is stored there now. Nothing was written.
    Stale,
}

impl fmt::Display for CasOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CasOutcome::Replaced => "replaced",
            CasOutcome::Missing => "missing",
            CasOutcome::Stale => "stale",
        };
        f.write_str(s)
    }
}

/// A message to publish together with a write, in the same atomic unit.
#[derive(Debug, Clone, Copy)]
pub struct Publish<'a> {
    pub channel: &'a str,
    pub message: &'a str,
}

/// A reference count kept inside a hash, see [`Backend::hash_hold`].
#[derive(Debug, Clone, Copy)]
pub struct Hold<'a> {
    /// Field holding the count.
    pub count_field: &'a str,
    /// Field set to `0` while held and to `release_stamp` once released.
    pub stamp_field: &'a str,
    pub release_stamp: i64,
    pub release_ttl: Duration,
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// The backing store.
///
/// Implementations are cheap handles (`Clone`) onto a shared connection
/// pool or shared state; every component receives its own clone.
///
/// Every method is a single atomic unit in the store. The returned futures
/// are `Send` so handlers generic over a backend can be spawned.
pub trait Backend: Clone + Send + Sync + 'static {
    /// The subscription handle produced by [`subscribe`](Self::subscribe).
    type Subscription: Subscription;

    // -- Sorted logs (score = event id) -----------------------------------

    /// Inserts `entry` at score `id` unless some entry already has that
    /// score. When inserted, `entry` is published on `channel`.
    ///
    /// Returns `false` (and publishes nothing) on collision.
    fn log_insert(
        &self,
        key: &str,
        id: i64,
        entry: &str,
        channel: &str,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Returns the entry at score `id`, if any.
    fn log_get(
        &self,
        key: &str,
        id: i64,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    /// Entries with `newest >= score >= oldest`, highest score first, at
    /// most `limit` of them.
    fn log_range(
        &self,
        key: &str,
        newest: Bound,
        oldest: Bound,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Replaces the entry at score `id` with `replacement` only if it is
    /// still exactly `expected`, publishing `publish` in the same unit.
    fn log_replace(
        &self,
        key: &str,
        id: i64,
        expected: &str,
        replacement: &str,
        publish: Publish<'_>,
    ) -> impl Future<Output = Result<CasOutcome, StoreError>> + Send;

    // -- Hashes ----------------------------------------------------------

    /// Sets `field` only if absent; publishes `publish` when it was set.
    fn hash_insert_nx(
        &self,
        key: &str,
        field: &str,
        value: &str,
        publish: Publish<'_>,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Replaces `field` only if it is still exactly `expected`, publishing
    /// `publish` in the same unit.
    fn hash_replace(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        value: &str,
        publish: Publish<'_>,
    ) -> impl Future<Output = Result<CasOutcome, StoreError>> + Send;

    fn hash_get(
        &self,
        key: &str,
        field: &str,
    ) -> impl Future<Output = Result<Option<String>, StoreError>> + Send;

    fn hash_get_all(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<HashMap<String, String>, StoreError>> + Send;

    /// Replaces the whole hash at `key` with `fields`. With `ttl` the key
    /// expires after that long; without, it persists.
    fn hash_create(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Adds `delta` to the reference count described by `hold`, only if
    /// the key exists. The count never drops below zero.
    ///
    /// While the count is positive the key persists and the stamp field
    /// reads `0`. When the count is back at zero the stamp becomes
    /// `hold.release_stamp` and the key expires after `hold.release_ttl`.
    ///
    /// Returns the new count, or `None` if the key is missing.
    fn hash_hold(
        &self,
        key: &str,
        delta: i64,
        hold: Hold<'_>,
    ) -> impl Future<Output = Result<Option<i64>, StoreError>> + Send;

    // -- Plain keys and counters ------------------------------------------

    fn exists(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Deletes `key`. Returns whether it existed.
    fn delete(&self, key: &str) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Sets a plain string value without expiry.
    fn set(&self, key: &str, value: &str) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remaining time to live, `None` if the key is missing or persistent.
    fn ttl(&self, key: &str)
    -> impl Future<Output = Result<Option<Duration>, StoreError>> + Send;

    /// Current counter value; 0 when the key is missing.
    fn counter_get(&self, key: &str) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Increments the counter, returning the new value.
    fn counter_incr(&self, key: &str) -> impl Future<Output = Result<i64, StoreError>> + Send;

    /// Increments the counter and (re)sets its expiry in one unit,
    /// returning the new value.
    fn counter_incr_expiring(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<i64, StoreError>> + Send;

    // -- Pub/sub ----------------------------------------------------------

    /// Publishes `message`, returning how many subscribers received it.
    fn publish(
        &self,
        channel: &str,
        message: &str,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;

    /// Opens a dedicated subscription to `channels`.
    fn subscribe(
        &self,
        channels: &[String],
    ) -> impl Future<Output = Result<Self::Subscription, StoreError>> + Send;

    /// Number of live subscriptions listening on `channel`.
    fn subscriber_count(
        &self,
        channel: &str,
    ) -> impl Future<Output = Result<usize, StoreError>> + Send;
}

/// A live subscription to one or more channels.
///
/// Dropping the subscription releases it; [`close`](Self::close) does the
/// same explicitly and waits for the store to acknowledge.
pub trait Subscription: Send + 'static {
    /// Waits up to `timeout` for the next message.
    ///
    /// - `Ok(Some(_))`: a message arrived
    /// - `Ok(None)`: the timeout elapsed with nothing to deliver
    /// - `Err(StoreError::Closed)`: the subscription's connection ended
    fn recv(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Notification>, StoreError>> + Send;

    /// Unsubscribes and releases the connection.
    fn close(self) -> impl Future<Output = ()> + Send;
}
