//! Async Redis-backed shared key/value/pub-sub store.
//!
//! Replaces the synchronous `redis::Commands` wrapper the rest of the
//! workspace still ships, since the gateway is fully async end to end.
//! Implements the key layout: `provider:global`, `http:ratelimit:*`,
//! `ws:connections:*`, `ws:rate:*`, `last_tick:*`, `providerLock:*`,
//! `ws:block:*`.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

#[derive(Clone)]
pub struct SharedStore {
    conn: ConnectionManager,
}

impl SharedStore {
    pub async fn connect(redis_url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    pub async fn get(&self, key: &str) -> redis::RedisResult<Option<String>> {
        self.conn.clone().get(key).await
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> redis::RedisResult<()> {
        self.conn.clone().set_ex(key, value, ttl_secs).await
    }

    pub async fn set(&self, key: &str, value: &str) -> redis::RedisResult<()> {
        self.conn.clone().set(key, value).await
    }

    pub async fn del(&self, key: &str) -> redis::RedisResult<()> {
        self.conn.clone().del(key).await
    }

    /// Atomic increment with a bucket TTL applied only on first creation
    /// (`EXPIRE key ttl NX`), the pattern behind the minute/second buckets
    /// in the data model.
    pub async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> redis::RedisResult<i64> {
        let mut conn = self.conn.clone();
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs)
                .arg("NX")
                .query_async(&mut conn)
                .await?;
        }
        Ok(count)
    }

    pub async fn decr(&self, key: &str) -> redis::RedisResult<i64> {
        self.conn.clone().decr(key, 1).await
    }

    /// `SET key value NX PX ttl_ms`, the cluster-wide mutual-exclusion
    /// primitive behind the provider queue's per-endpoint lock.
    pub async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> redis::RedisResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    pub async fn pttl(&self, key: &str) -> redis::RedisResult<i64> {
        self.conn.clone().pttl(key).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> redis::RedisResult<()> {
        self.conn.clone().sadd(key, member).await
    }

    pub async fn srem(&self, key: &str, member: &str) -> redis::RedisResult<()> {
        self.conn.clone().srem(key, member).await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> redis::RedisResult<bool> {
        self.conn.clone().sismember(key, member).await
    }
}
