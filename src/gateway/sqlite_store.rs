use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::OptionalExtension;
use thiserror::Error;

use super::counter_store::{CounterStore, CounterStoreError};
use super::{Clock, SystemClock};

/// Minimum spacing between expired-row purges run from `incr_and_expire`.
const PURGE_INTERVAL_MS: u64 = 60_000;

#[derive(Clone)]
pub struct SqliteStore {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    next_purge_ms: Arc<AtomicU64>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("path", &self.path)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            clock: Arc::new(SystemClock),
            next_purge_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Clock used to evaluate row expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Drop rows whose expiry has passed. Returns the number of rows removed.
    pub async fn purge_expired(&self) -> Result<u64, SqliteStoreError> {
        let path = self.path.clone();
        let now_ms = u64_to_i64(self.clock.now_epoch_millis());
        tokio::task::spawn_blocking(move || -> Result<u64, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            let removed = purge_expired_rows(&tx, now_ms)?;
            tx.commit()?;
            Ok(removed as u64)
        })
        .await?
    }

    /// Claim the next periodic purge slot. Only one caller wins per interval.
    fn purge_due(&self, now_ms: u64) -> bool {
        let next = self.next_purge_ms.load(Ordering::Relaxed);
        now_ms >= next
            && self
                .next_purge_ms
                .compare_exchange(
                    next,
                    now_ms.saturating_add(PURGE_INTERVAL_MS),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
    }

    pub async fn incr_and_expire(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<u64, SqliteStoreError> {
        let path = self.path.clone();
        let key = key.to_string();
        let now_ms = self.clock.now_epoch_millis();
        let expires_at_ms = u64_to_i64(expiry(now_ms, window_seconds));
        let purge = self.purge_due(now_ms);
        let now_ms = u64_to_i64(now_ms);

        tokio::task::spawn_blocking(move || -> Result<u64, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            if purge {
                purge_expired_rows(&conn, now_ms)?;
            }
            let value: i64 = conn.query_row(
                "INSERT INTO counters (key, value, expires_at_ms) VALUES (?1, 1, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = CASE WHEN counters.expires_at_ms <= ?2 THEN 1 ELSE counters.value + 1 END,
                    expires_at_ms = ?3
                 RETURNING value",
                rusqlite::params![key, now_ms, expires_at_ms],
                |row| row.get(0),
            )?;
            Ok(i64_to_u64(value))
        })
        .await?
    }

    pub async fn get(&self, key: &str) -> Result<Option<u64>, SqliteStoreError> {
        let path = self.path.clone();
        let key = key.to_string();
        let now_ms = u64_to_i64(self.clock.now_epoch_millis());

        tokio::task::spawn_blocking(move || -> Result<Option<u64>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let value: Option<i64> = conn
                .query_row(
                    "SELECT value FROM counters WHERE key = ?1 AND expires_at_ms > ?2",
                    rusqlite::params![key, now_ms],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.map(i64_to_u64))
        })
        .await?
    }

    pub async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl_seconds: u64,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let key = key.to_string();
        let value = u64_to_i64(value);
        let expires_at_ms = u64_to_i64(expiry(self.clock.now_epoch_millis(), ttl_seconds));

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO counters (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    expires_at_ms = excluded.expires_at_ms",
                rusqlite::params![key, value, expires_at_ms],
            )?;
            Ok(())
        })
        .await?
    }

    pub async fn push_recent(
        &self,
        key: &str,
        value: &str,
        keep: usize,
        ttl_seconds: u64,
    ) -> Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let key = key.to_string();
        let value = value.to_string();
        let keep = u64_to_i64(keep.max(1) as u64);
        let now_ms = self.clock.now_epoch_millis();
        let expires_at_ms = u64_to_i64(expiry(now_ms, ttl_seconds));
        let now_ms = u64_to_i64(now_ms);

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM recent_values WHERE key = ?1 AND expires_at_ms <= ?2",
                rusqlite::params![key, now_ms],
            )?;
            tx.execute(
                "INSERT INTO recent_values (key, value, expires_at_ms) VALUES (?1, ?2, ?3)",
                rusqlite::params![key, value, expires_at_ms],
            )?;
            tx.execute(
                "UPDATE recent_values SET expires_at_ms = ?2 WHERE key = ?1",
                rusqlite::params![key, expires_at_ms],
            )?;
            tx.execute(
                "DELETE FROM recent_values
                 WHERE key = ?1 AND id NOT IN (
                    SELECT id FROM recent_values WHERE key = ?1 ORDER BY id DESC LIMIT ?2
                 )",
                rusqlite::params![key, keep],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn recent(&self, key: &str) -> Result<Vec<String>, SqliteStoreError> {
        let path = self.path.clone();
        let key = key.to_string();
        let now_ms = u64_to_i64(self.clock.now_epoch_millis());

        tokio::task::spawn_blocking(move || -> Result<Vec<String>, SqliteStoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT value FROM recent_values
                 WHERE key = ?1 AND expires_at_ms > ?2
                 ORDER BY id ASC",
            )?;
            let rows = stmt.query_map(rusqlite::params![key, now_ms], |row| {
                row.get::<_, String>(0)
            })?;
            let mut values = Vec::new();
            for row in rows {
                values.push(row?);
            }
            Ok(values)
        })
        .await?
    }

    pub async fn delete(&self, keys: &[String]) -> Result<(), SqliteStoreError> {
        if keys.is_empty() {
            return Ok(());
        }
        let path = self.path.clone();
        let keys = keys.to_vec();

        tokio::task::spawn_blocking(move || -> Result<(), SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            for key in &keys {
                tx.execute(
                    "DELETE FROM counters WHERE key = ?1",
                    rusqlite::params![key],
                )?;
                tx.execute(
                    "DELETE FROM recent_values WHERE key = ?1",
                    rusqlite::params![key],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    pub async fn delete_prefix(&self, prefix: &str) -> Result<u64, SqliteStoreError> {
        let path = self.path.clone();
        let prefix = prefix.to_string();

        tokio::task::spawn_blocking(move || -> Result<u64, SqliteStoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            let tx = conn.transaction()?;
            let counters = tx.execute(
                "DELETE FROM counters WHERE substr(key, 1, length(?1)) = ?1",
                rusqlite::params![prefix],
            )?;
            let recent = tx.execute(
                "DELETE FROM recent_values WHERE substr(key, 1, length(?1)) = ?1",
                rusqlite::params![prefix],
            )?;
            tx.commit()?;
            Ok((counters + recent) as u64)
        })
        .await?
    }
}

#[async_trait]
impl CounterStore for SqliteStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn incr_and_expire(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<u64, CounterStoreError> {
        Ok(SqliteStore::incr_and_expire(self, key, window_seconds).await?)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError> {
        Ok(SqliteStore::get(self, key).await?)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl_seconds: u64,
    ) -> Result<(), CounterStoreError> {
        Ok(SqliteStore::set_with_expiry(self, key, value, ttl_seconds).await?)
    }

    async fn push_recent(
        &self,
        key: &str,
        value: &str,
        keep: usize,
        ttl_seconds: u64,
    ) -> Result<(), CounterStoreError> {
        Ok(SqliteStore::push_recent(self, key, value, keep, ttl_seconds).await?)
    }

    async fn recent(&self, key: &str) -> Result<Vec<String>, CounterStoreError> {
        Ok(SqliteStore::recent(self, key).await?)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CounterStoreError> {
        Ok(SqliteStore::delete(self, keys).await?)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CounterStoreError> {
        Ok(SqliteStore::delete_prefix(self, prefix).await?)
    }
}

fn init_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS counters (
            key TEXT PRIMARY KEY NOT NULL,
            value INTEGER NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS recent_values (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            expires_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_recent_values_key
            ON recent_values(key, id);",
    )
}

fn purge_expired_rows(conn: &rusqlite::Connection, now_ms: i64) -> Result<usize, rusqlite::Error> {
    let counters = conn.execute(
        "DELETE FROM counters WHERE expires_at_ms <= ?1",
        rusqlite::params![now_ms],
    )?;
    let recent = conn.execute(
        "DELETE FROM recent_values WHERE expires_at_ms <= ?1",
        rusqlite::params![now_ms],
    )?;
    Ok(counters + recent)
}

fn open_connection(path: PathBuf) -> Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    let _ = conn.busy_timeout(Duration::from_secs(5));
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn expiry(now_ms: u64, ttl_seconds: u64) -> u64 {
    now_ms.saturating_add(ttl_seconds.saturating_mul(1000))
}

fn u64_to_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}
