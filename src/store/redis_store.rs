//! Redis-backed counter store.
//!
//! Uses a [`ConnectionManager`], which multiplexes requests from all tasks
//! over one connection and reconnects in the background after a failure.
//! Commands issued while disconnected fail immediately instead of queueing.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::info;

use super::{CounterStore, StoreError};

/// Increment and set the expiry in one atomic step. The expiry is only set
/// when the increment created the key.
const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if count == tonumber(ARGV[1]) then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
";

/// Create the block marker with `SET NX` and, only if that succeeded, give
/// the counter the same expiry.
const SET_AND_EXPIRE_SCRIPT: &str = r"
if redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2], 'NX') then
    redis.call('PEXPIRE', KEYS[2], ARGV[2])
    return 1
end
return 0
";

/// A [`CounterStore`] backed by Redis.
pub struct RedisStore {
    conn: ConnectionManager,
    increment: Script,
    set_and_expire: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis counter store");
        Ok(Self::new(conn))
    }

    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment: Script::new(INCREMENT_SCRIPT),
            set_and_expire: Script::new(SET_AND_EXPIRE_SCRIPT),
        }
    }
}

/// Redis rejects a zero expiry, so round sub-millisecond TTLs up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, by: u64, ttl_if_new: Duration) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: u64 = self
            .increment
            .key(key)
            .arg(by)
            .arg(ttl_millis(ttl_if_new))
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<u64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_if_absent(&self, key: &str, value: u64, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn set_if_absent_and_expire(
        &self,
        key: &str,
        value: u64,
        ttl: Duration,
        expire_key: &str,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let created: i64 = self
            .set_and_expire
            .key(key)
            .key(expire_key)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(created == 1)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        // -2 for a missing key, -1 for a key without expiry.
        let ms: i64 = redis::cmd("PTTL").arg(key).query_async(&mut conn).await?;
        Ok(u64::try_from(ms).ok().map(Duration::from_millis))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }
}
