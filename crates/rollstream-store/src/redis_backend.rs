//! Redis [`Backend`] using the `redis` crate.
//!
//! Commands go over one shared multiplexed connection. Every conditional
//! write (insert-if-absent, compare-and-swap) plus its publish runs as a
//! Lua script, so Redis executes it as one unit. Subscriptions open their
//! own dedicated pub/sub connection.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::LazyLock;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use redis::aio::MultiplexedConnection;
use redis::{Client, Msg, Script};

use crate::{
    Backend, Bound, CasOutcome, Hold, Notification, Publish, StoreError, Subscription,
};

/// KEYS[1] log. ARGV: score, entry, channel.
static LOG_INSERT: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if #redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[1], 'LIMIT', 0, 1) > 0 then
            return 0
        end
        redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
        redis.call('PUBLISH', ARGV[3], ARGV[2])
        return 1
        ",
    )
});

/// KEYS[1] log. ARGV: score, expected, replacement, channel, message.
static LOG_REPLACE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local current = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[1], 'LIMIT', 0, 1)
        if #current == 0 then
            return 0
        end
        if current[1] ~= ARGV[2] then
            return -1
        end
        redis.call('ZREM', KEYS[1], current[1])
        redis.call('ZADD', KEYS[1], ARGV[1], ARGV[3])
        redis.call('PUBLISH', ARGV[4], ARGV[5])
        return 1
        ",
    )
});

/// KEYS[1] hash. ARGV: field, value, channel, message.
static HASH_INSERT_NX: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then
            return 0
        end
        redis.call('PUBLISH', ARGV[3], ARGV[4])
        return 1
        ",
    )
});

/// KEYS[1] hash. ARGV: field, expected, value, channel, message.
static HASH_REPLACE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        local current = redis.call('HGET', KEYS[1], ARGV[1])
        if not current then
            return 0
        end
        if current ~= ARGV[2] then
            return -1
        end
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
        redis.call('PUBLISH', ARGV[4], ARGV[5])
        return 1
        ",
    )
});

/// KEYS[1] hash. ARGV: count field, stamp field, delta, release stamp,
/// release ttl millis.
static HASH_HOLD: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
        if redis.call('EXISTS', KEYS[1]) == 0 then
            return -1
        end
        local count = redis.call('HINCRBY', KEYS[1], ARGV[1], ARGV[3])
        if count < 0 then
            count = 0
            redis.call('HSET', KEYS[1], ARGV[1], 0)
        end
        if count > 0 then
            redis.call('HSET', KEYS[1], ARGV[2], 0)
            redis.call('PERSIST', KEYS[1])
        else
            redis.call('HSET', KEYS[1], ARGV[2], ARGV[4])
            redis.call('PEXPIRE', KEYS[1], ARGV[5])
        end
        return count
        ",
    )
});

fn cas_outcome(code: i64) -> CasOutcome {
    match code {
        1 => CasOutcome::Replaced,
        0 => CasOutcome::Missing,
        _ => CasOutcome::Stale,
    }
}

fn upper(bound: Bound) -> String {
    match bound {
        Bound::Unbounded => "+inf".to_string(),
        Bound::Inclusive(n) => n.to_string(),
    }
}

fn lower(bound: Bound) -> String {
    match bound {
        Bound::Unbounded => "-inf".to_string(),
        Bound::Inclusive(n) => n.to_string(),
    }
}

fn millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

/// A handle onto a Redis server. Clones share the multiplexed connection.
#[derive(Clone)]
pub struct RedisBackend {
    client: Client,
    conn: MultiplexedConnection,
}

impl RedisBackend {
    /// Connects to the server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::info!(url, "connected to redis");
        Ok(Self { client, conn })
    }
}

impl Backend for RedisBackend {
    type Subscription = RedisSubscription;

    async fn log_insert(
        &self,
        key: &str,
        id: i64,
        entry: &str,
        channel: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let inserted: i64 = LOG_INSERT
            .key(key)
            .arg(id)
            .arg(entry)
            .arg(channel)
            .invoke_async(&mut conn)
            .await?;
        Ok(inserted == 1)
    }

    async fn log_get(&self, key: &str, id: i64) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let found: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(id)
            .arg(id)
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await?;
        Ok(found.into_iter().next())
    }

    async fn log_range(
        &self,
        key: &str,
        newest: Bound,
        oldest: Bound,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = redis::cmd("ZREVRANGEBYSCORE")
            .arg(key)
            .arg(upper(newest))
            .arg(lower(oldest))
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn log_replace(
        &self,
        key: &str,
        id: i64,
        expected: &str,
        replacement: &str,
        publish: Publish<'_>,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let code: i64 = LOG_REPLACE
            .key(key)
            .arg(id)
            .arg(expected)
            .arg(replacement)
            .arg(publish.channel)
            .arg(publish.message)
            .invoke_async(&mut conn)
            .await?;
        Ok(cas_outcome(code))
    }

    async fn hash_insert_nx(
        &self,
        key: &str,
        field: &str,
        value: &str,
        publish: Publish<'_>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let set: i64 = HASH_INSERT_NX
            .key(key)
            .arg(field)
            .arg(value)
            .arg(publish.channel)
            .arg(publish.message)
            .invoke_async(&mut conn)
            .await?;
        Ok(set == 1)
    }

    async fn hash_replace(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        value: &str,
        publish: Publish<'_>,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let code: i64 = HASH_REPLACE
            .key(key)
            .arg(field)
            .arg(expected)
            .arg(value)
            .arg(publish.channel)
            .arg(publish.message)
            .invoke_async(&mut conn)
            .await?;
        Ok(cas_outcome(code))
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        let all: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(all)
    }

    async fn hash_create(
        &self,
        key: &str,
        fields: &[(&str, String)],
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(key).ignore();
        let hset = pipe.cmd("HSET").arg(key);
        for (field, value) in fields {
            hset.arg(*field).arg(value.as_str());
        }
        hset.ignore();
        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl)).ignore();
        }
        let () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn hash_hold(
        &self,
        key: &str,
        delta: i64,
        hold: Hold<'_>,
    ) -> Result<Option<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let mut invocation = HASH_HOLD.key(key);
        invocation
            .arg(hold.count_field)
            .arg(hold.stamp_field)
            .arg(delta)
            .arg(hold.release_stamp)
            .arg(millis(hold.release_ttl));
        let count: i64 = invocation.invoke_async(&mut conn).await?;
        Ok((count >= 0).then_some(count))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = redis::cmd("SET").arg(key).arg(value).query_async(&mut conn).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        // -2 missing, -1 no expiry.
        Ok((ms >= 0).then(|| Duration::from_millis(ms as u64)))
    }

    async fn counter_get(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value.unwrap_or(0))
    }

    async fn counter_incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let value: i64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn counter_incr_expiring(&self, key: &str, ttl: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let (value,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let receivers: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(message)
            .query_async(&mut conn)
            .await?;
        Ok(receivers)
    }

    async fn subscribe(&self, channels: &[String]) -> Result<RedisSubscription, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(channel.as_str()).await?;
        }
        tracing::debug!(?channels, "redis subscription opened");
        Ok(RedisSubscription {
            messages: Box::pin(pubsub.into_on_message()),
        })
    }

    async fn subscriber_count(&self, channel: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let (_, count): (String, usize) = redis::cmd("PUBSUB")
            .arg("NUMSUB")
            .arg(channel)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}

/// A dedicated Redis pub/sub connection. Dropping it closes the
/// connection, which unsubscribes from every channel.
pub struct RedisSubscription {
    messages: Pin<Box<dyn Stream<Item = Msg> + Send>>,
}

impl Subscription for RedisSubscription {
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Notification>, StoreError> {
        match tokio::time::timeout(timeout, self.messages.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => Err(StoreError::Closed),
            Ok(Some(msg)) => {
                let payload: String = msg.get_payload()?;
                Ok(Some(Notification {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }))
            }
        }
    }

    async fn close(self) {
        drop(self.messages);
        tracing::debug!("redis subscription closed");
    }
}
