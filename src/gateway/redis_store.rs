use async_trait::async_trait;
use redis::AsyncCommands;
use thiserror::Error;

use super::counter_store::{CounterStore, CounterStoreError};

#[derive(Clone, Debug)]
pub struct RedisStore {
    client: redis::Client,
    prefix: String,
}

#[derive(Debug, Error)]
pub enum RedisStoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl RedisStore {
    pub fn new(url: impl AsRef<str>) -> Result<Self, RedisStoreError> {
        Ok(Self {
            client: redis::Client::open(url.as_ref())?,
            prefix: "ditto".to_string(),
        })
    }

    /// Namespace prepended to every key this store touches.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, redis::RedisError> {
        self.client.get_multiplexed_async_connection().await
    }

    pub async fn ping(&self) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: Option<String> = conn.get(format!("{}:__ping__", self.prefix)).await?;
        Ok(())
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    pub async fn incr_and_expire(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<u64, RedisStoreError> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .incr(&key, 1u64)
            .expire(&key, seconds_to_i64(window_seconds))
            .ignore();
        let (count,): (u64,) = pipe.query_async(&mut conn).await?;
        Ok(count)
    }

    pub async fn get(&self, key: &str) -> Result<Option<u64>, RedisStoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(self.key(key)).await?)
    }

    pub async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl_seconds: u64,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn.set_ex(self.key(key), value, ttl_seconds).await?;
        Ok(())
    }

    pub async fn push_recent(
        &self,
        key: &str,
        value: &str,
        keep: usize,
        ttl_seconds: u64,
    ) -> Result<(), RedisStoreError> {
        let mut conn = self.connection().await?;
        let key = self.key(key);
        let keep = isize::try_from(keep.max(1)).unwrap_or(isize::MAX);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .rpush(&key, value)
            .ignore()
            .ltrim(&key, -keep, -1)
            .ignore()
            .expire(&key, seconds_to_i64(ttl_seconds))
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn recent(&self, key: &str) -> Result<Vec<String>, RedisStoreError> {
        let mut conn = self.connection().await?;
        Ok(conn.lrange(self.key(key), 0, -1).await?)
    }

    pub async fn delete(&self, keys: &[String]) -> Result<u64, RedisStoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection().await?;
        let keys: Vec<String> = keys.iter().map(|key| self.key(key)).collect();
        Ok(conn.del(keys).await?)
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64, RedisStoreError> {
        let pattern = format!("{}*", escape_glob(&self.key(prefix)));
        let mut conn = self.connection().await?;
        let mut deleted = 0u64;

        let mut cursor = "0".to_string();
        loop {
            let (next_cursor, keys): (String, Vec<String>) = redis::cmd("SCAN")
                .arg(&cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(256)
                .query_async(&mut conn)
                .await?;

            for chunk in keys.chunks(128) {
                deleted = deleted.saturating_add(conn.del(chunk).await?);
            }

            if next_cursor == "0" {
                break;
            }
            cursor = next_cursor;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn incr_and_expire(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<u64, CounterStoreError> {
        Ok(RedisStore::incr_and_expire(self, key, window_seconds).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError> {
        Ok(RedisStore::get(self, key).await?)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl_seconds: u64,
    ) -> Result<(), CounterStoreError> {
        Ok(RedisStore::set_with_expiry(self, key, value, ttl_seconds).await?)
    }

    async fn push_recent(
        &self,
        key: &str,
        value: &str,
        keep: usize,
        ttl_seconds: u64,
    ) -> Result<(), CounterStoreError> {
        Ok(RedisStore::push_recent(self, key, value, keep, ttl_seconds).await?)
    }

    async fn recent(&self, key: &str) -> Result<Vec<String>, CounterStoreError> {
        Ok(RedisStore::recent(self, key).await?)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CounterStoreError> {
        RedisStore::delete(self, keys).await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CounterStoreError> {
        Ok(RedisStore::delete_prefix(self, prefix).await?)
    }
}

fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn seconds_to_i64(seconds: u64) -> i64 {
    if seconds > i64::MAX as u64 {
        i64::MAX
    } else {
        seconds as i64
    }
}
