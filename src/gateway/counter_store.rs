//! Counter persistence behind admission control.
//!
//! `CounterStore` is the small key/value surface every backend implements;
//! `DualBackendCounterStore` layers the subject key layout and a short-lived
//! read cache on top of whichever backend was selected at startup.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Clock;
use super::context::ContextEntry;
use super::limits::WindowKind;

#[cfg(feature = "store-redis")]
use super::redis_store::{RedisStore, RedisStoreError};
#[cfg(feature = "store-sqlite")]
use super::sqlite_store::{SqliteStore, SqliteStoreError};

/// Lifetime of the cooldown mark and the recent-fingerprint list.
pub const SUBJECT_STATE_TTL_SECS: u64 = 60 * 60;

/// Lifetime of persisted conversation history, refreshed on every append.
pub const HISTORY_TTL_SECS: u64 = 30 * 24 * 60 * 60;

const MEMORY_SWEEP_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[cfg(feature = "store-redis")]
    #[error(transparent)]
    Redis(#[from] RedisStoreError),
    #[cfg(feature = "store-sqlite")]
    #[error(transparent)]
    Sqlite(#[from] SqliteStoreError),
    #[error("counter store join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("counter store encoding error: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CounterStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Increment `key` and (re)arm its expiry; returns the new value.
    async fn incr_and_expire(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<u64, CounterStoreError>;

    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError>;

    async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl_seconds: u64,
    ) -> Result<(), CounterStoreError>;

    /// Append to a list keeping only the newest `keep` values.
    async fn push_recent(
        &self,
        key: &str,
        value: &str,
        keep: usize,
        ttl_seconds: u64,
    ) -> Result<(), CounterStoreError>;

    /// List values, oldest first.
    async fn recent(&self, key: &str) -> Result<Vec<String>, CounterStoreError>;

    async fn delete(&self, keys: &[String]) -> Result<(), CounterStoreError>;

    /// Delete every key starting with `prefix`; returns how many went away.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CounterStoreError>;
}

#[derive(Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterBackendConfig {
    #[default]
    Memory,
    Redis {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prefix: Option<String>,
    },
    Sqlite {
        path: std::path::PathBuf,
    },
}

impl std::fmt::Debug for CounterBackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => f.write_str("Memory"),
            Self::Redis { prefix, .. } => f
                .debug_struct("Redis")
                .field("url", &"<redacted>")
                .field("prefix", prefix)
                .finish(),
            Self::Sqlite { path } => f.debug_struct("Sqlite").field("path", path).finish(),
        }
    }
}

impl CounterBackendConfig {
    /// Build the configured backend. Backends compiled out of this build are
    /// reported as unavailable.
    pub async fn open(
        &self,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<dyn CounterStore>, CounterStoreError> {
        match self {
            Self::Memory => Ok(Arc::new(MemoryCounterStore::new(clock))),
            #[cfg(feature = "store-redis")]
            Self::Redis { url, prefix } => {
                let mut store = RedisStore::new(url)?;
                if let Some(prefix) = prefix {
                    store = store.with_prefix(prefix.clone());
                }
                store.ping().await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "store-redis"))]
            Self::Redis { .. } => Err(CounterStoreError::Unavailable(
                "redis backend requires the `store-redis` feature".to_string(),
            )),
            #[cfg(feature = "store-sqlite")]
            Self::Sqlite { path } => {
                let store = SqliteStore::new(path.clone()).with_clock(clock);
                store.init().await?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "store-sqlite"))]
            Self::Sqlite { .. } => Err(CounterStoreError::Unavailable(
                "sqlite backend requires the `store-sqlite` feature".to_string(),
            )),
        }
    }
}

#[derive(Debug)]
enum MemoryValue {
    Counter(u64),
    List(VecDeque<String>),
}

#[derive(Debug)]
struct MemoryEntry {
    value: MemoryValue,
    expires_at_ms: u64,
}

/// In-process backend. State does not survive a restart.
///
/// Expired entries are dropped when their key is read again and by a sweep
/// that runs on writes at most once per minute.
pub struct MemoryCounterStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, MemoryEntry>>,
    next_sweep_ms: AtomicU64,
}

impl std::fmt::Debug for MemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCounterStore")
            .field("entries", &self.lock().len())
            .finish()
    }
}

impl MemoryCounterStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            next_sweep_ms: AtomicU64::new(0),
        }
    }

    /// Entries currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock for a write, sweeping expired entries first when a sweep is due.
    fn lock_for_write(&self, now_ms: u64) -> MutexGuard<'_, HashMap<String, MemoryEntry>> {
        let mut entries = self.lock();
        if now_ms >= self.next_sweep_ms.load(Ordering::Relaxed) {
            entries.retain(|_, entry| entry.expires_at_ms > now_ms);
            self.next_sweep_ms.store(
                now_ms.saturating_add(MEMORY_SWEEP_INTERVAL_MS),
                Ordering::Relaxed,
            );
        }
        entries
    }

    fn live_entry<'a>(
        entries: &'a mut HashMap<String, MemoryEntry>,
        key: &str,
        now_ms: u64,
    ) -> Option<&'a mut MemoryEntry> {
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at_ms <= now_ms)
        {
            entries.remove(key);
        }
        entries.get_mut(key)
    }
}

fn expiry(now_ms: u64, ttl_seconds: u64) -> u64 {
    now_ms.saturating_add(ttl_seconds.saturating_mul(1000))
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn incr_and_expire(
        &self,
        key: &str,
        window_seconds: u64,
    ) -> Result<u64, CounterStoreError> {
        let now_ms = self.clock.now_epoch_millis();
        let mut entries = self.lock_for_write(now_ms);
        let current = match Self::live_entry(&mut entries, key, now_ms) {
            Some(MemoryEntry {
                value: MemoryValue::Counter(value),
                ..
            }) => *value,
            _ => 0,
        };
        let next = current.saturating_add(1);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Counter(next),
                expires_at_ms: expiry(now_ms, window_seconds),
            },
        );
        Ok(next)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, CounterStoreError> {
        let now_ms = self.clock.now_epoch_millis();
        let mut entries = self.lock();
        Ok(match Self::live_entry(&mut entries, key, now_ms) {
            Some(MemoryEntry {
                value: MemoryValue::Counter(value),
                ..
            }) => Some(*value),
            _ => None,
        })
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: u64,
        ttl_seconds: u64,
    ) -> Result<(), CounterStoreError> {
        let now_ms = self.clock.now_epoch_millis();
        self.lock_for_write(now_ms).insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Counter(value),
                expires_at_ms: expiry(now_ms, ttl_seconds),
            },
        );
        Ok(())
    }

    async fn push_recent(
        &self,
        key: &str,
        value: &str,
        keep: usize,
        ttl_seconds: u64,
    ) -> Result<(), CounterStoreError> {
        let now_ms = self.clock.now_epoch_millis();
        let mut entries = self.lock_for_write(now_ms);
        let mut list = match Self::live_entry(&mut entries, key, now_ms) {
            Some(MemoryEntry {
                value: MemoryValue::List(list),
                ..
            }) => std::mem::take(list),
            _ => VecDeque::new(),
        };
        list.push_back(value.to_string());
        while list.len() > keep {
            list.pop_front();
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::List(list),
                expires_at_ms: expiry(now_ms, ttl_seconds),
            },
        );
        Ok(())
    }

    async fn recent(&self, key: &str) -> Result<Vec<String>, CounterStoreError> {
        let now_ms = self.clock.now_epoch_millis();
        let mut entries = self.lock();
        Ok(match Self::live_entry(&mut entries, key, now_ms) {
            Some(MemoryEntry {
                value: MemoryValue::List(list),
                ..
            }) => list.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CounterStoreError> {
        let mut entries = self.lock();
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CounterStoreError> {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}

/// Persisted admission state for one subject as of `read_at_ms`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubjectSnapshot {
    pub minute_bucket: u64,
    pub minute_count: u64,
    pub hour_bucket: u64,
    pub hour_count: u64,
    pub last_request_at_ms: Option<u64>,
    pub recent_fingerprints: Vec<String>,
    pub read_at_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowCounts {
    pub minute: u64,
    pub hour: u64,
}

/// Subject-level view over a `CounterStore` with a small read cache.
///
/// Keys are unprefixed; shared backends such as Redis add their own namespace.
pub struct DualBackendCounterStore {
    backend: Arc<dyn CounterStore>,
    cache_ttl: Duration,
    clock: Arc<dyn Clock>,
    cache: Mutex<HashMap<String, SubjectSnapshot>>,
}

impl std::fmt::Debug for DualBackendCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualBackendCounterStore")
            .field("backend", &self.backend.backend_name())
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl DualBackendCounterStore {
    pub fn new(backend: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            cache_ttl: Duration::from_secs(5),
            clock,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(Arc::new(MemoryCounterStore::new(clock.clone())), clock)
    }

    pub async fn open(
        config: &CounterBackendConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CounterStoreError> {
        let backend = config.open(clock.clone()).await?;
        tracing::info!(backend = backend.backend_name(), "counter store ready");
        Ok(Self::new(backend, clock))
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn backend(&self) -> &Arc<dyn CounterStore> {
        &self.backend
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    pub fn key_window(&self, subject: &str, kind: WindowKind, bucket: u64) -> String {
        format!("ratelimit:{subject}:{kind}:{bucket}")
    }

    pub fn key_last_request(&self, subject: &str) -> String {
        format!("lastmsg:{subject}")
    }

    pub fn key_recent(&self, subject: &str) -> String {
        format!("spam:{subject}")
    }

    pub fn key_history(&self, subject: &str) -> String {
        format!("history:{subject}")
    }

    /// Persisted state for `subject`. Served from the local cache while the
    /// cached copy is younger than the cache TTL and still in the same buckets.
    pub async fn snapshot(&self, subject: &str) -> Result<SubjectSnapshot, CounterStoreError> {
        let now_ms = self.clock.now_epoch_millis();
        if let Some(cached) = self.cached(subject, now_ms) {
            return Ok(cached);
        }

        let minute_bucket = WindowKind::Minute.bucket(now_ms);
        let hour_bucket = WindowKind::Hour.bucket(now_ms);
        let minute_count = self
            .backend
            .get(&self.key_window(subject, WindowKind::Minute, minute_bucket))
            .await?
            .unwrap_or(0);
        let hour_count = self
            .backend
            .get(&self.key_window(subject, WindowKind::Hour, hour_bucket))
            .await?
            .unwrap_or(0);
        let last_request_at_ms = self.backend.get(&self.key_last_request(subject)).await?;
        let recent_fingerprints = self.backend.recent(&self.key_recent(subject)).await?;

        let snapshot = SubjectSnapshot {
            minute_bucket,
            minute_count,
            hour_bucket,
            hour_count,
            last_request_at_ms,
            recent_fingerprints,
            read_at_ms: now_ms,
        };
        self.lock_cache()
            .insert(subject.to_string(), snapshot.clone());
        Ok(snapshot)
    }

    /// Write through an accepted request: both window counters and the
    /// cooldown mark.
    pub async fn record_accept(
        &self,
        subject: &str,
        at_ms: u64,
    ) -> Result<WindowCounts, CounterStoreError> {
        let minute_bucket = WindowKind::Minute.bucket(at_ms);
        let hour_bucket = WindowKind::Hour.bucket(at_ms);
        let minute = self
            .backend
            .incr_and_expire(
                &self.key_window(subject, WindowKind::Minute, minute_bucket),
                WindowKind::Minute.seconds(),
            )
            .await?;
        let hour = self
            .backend
            .incr_and_expire(
                &self.key_window(subject, WindowKind::Hour, hour_bucket),
                WindowKind::Hour.seconds(),
            )
            .await?;
        self.backend
            .set_with_expiry(&self.key_last_request(subject), at_ms, SUBJECT_STATE_TTL_SECS)
            .await?;

        if let Some(cached) = self.lock_cache().get_mut(subject) {
            if cached.minute_bucket == minute_bucket {
                cached.minute_count = cached.minute_count.max(minute);
            }
            if cached.hour_bucket == hour_bucket {
                cached.hour_count = cached.hour_count.max(hour);
            }
            cached.last_request_at_ms = Some(cached.last_request_at_ms.unwrap_or(0).max(at_ms));
        }
        Ok(WindowCounts { minute, hour })
    }

    pub async fn record_fingerprint(
        &self,
        subject: &str,
        fingerprint: &str,
        keep: usize,
    ) -> Result<(), CounterStoreError> {
        self.backend
            .push_recent(
                &self.key_recent(subject),
                fingerprint,
                keep,
                SUBJECT_STATE_TTL_SECS,
            )
            .await?;
        if let Some(cached) = self.lock_cache().get_mut(subject) {
            cached.recent_fingerprints.push(fingerprint.to_string());
            let excess = cached.recent_fingerprints.len().saturating_sub(keep);
            cached.recent_fingerprints.drain(..excess);
        }
        Ok(())
    }

    /// Delete the admission state stored for `subject`: every window bucket,
    /// the cooldown mark and the recent-fingerprint list.
    pub async fn clear_subject(&self, subject: &str) -> Result<(), CounterStoreError> {
        self.lock_cache().remove(subject);
        let removed = self
            .backend
            .delete_prefix(&format!("ratelimit:{subject}:"))
            .await?;
        tracing::debug!(subject, removed, "deleted window counters");
        self.backend
            .delete(&[self.key_last_request(subject), self.key_recent(subject)])
            .await
    }

    /// Append one conversation entry, keeping the newest `keep`.
    pub async fn record_history(
        &self,
        subject: &str,
        entry: &ContextEntry,
        keep: usize,
    ) -> Result<(), CounterStoreError> {
        let encoded = serde_json::to_string(entry)?;
        self.backend
            .push_recent(&self.key_history(subject), &encoded, keep, HISTORY_TTL_SECS)
            .await
    }

    /// Persisted conversation for `subject`, oldest first. Entries that no
    /// longer decode are skipped.
    pub async fn history(&self, subject: &str) -> Result<Vec<ContextEntry>, CounterStoreError> {
        let raw = self.backend.recent(&self.key_history(subject)).await?;
        Ok(raw
            .iter()
            .filter_map(|value| match serde_json::from_str(value) {
                Ok(entry) => Some(entry),
                Err(err) => {
                    tracing::debug!(subject, error = %err, "skipping undecodable history entry");
                    None
                }
            })
            .collect())
    }

    pub async fn clear_history(&self, subject: &str) -> Result<(), CounterStoreError> {
        self.backend.delete(&[self.key_history(subject)]).await
    }

    fn cached(&self, subject: &str, now_ms: u64) -> Option<SubjectSnapshot> {
        let cache = self.lock_cache();
        let cached = cache.get(subject)?;
        let fresh = now_ms.saturating_sub(cached.read_at_ms) < self.cache_ttl.as_millis() as u64
            && cached.minute_bucket == WindowKind::Minute.bucket(now_ms)
            && cached.hour_bucket == WindowKind::Hour.bucket(now_ms);
        fresh.then(|| cached.clone())
    }

    fn lock_cache(&self) -> MutexGuard<'_, HashMap<String, SubjectSnapshot>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ManualClock;
    use crate::gateway::context::Role;

    fn memory() -> (Arc<ManualClock>, MemoryCounterStore) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        (clock.clone(), MemoryCounterStore::new(clock))
    }

    #[tokio::test]
    async fn memory_counters_increment_and_expire() {
        let (clock, store) = memory();
        assert_eq!(store.incr_and_expire("k", 60).await.expect("incr"), 1);
        assert_eq!(store.incr_and_expire("k", 60).await.expect("incr"), 2);
        assert_eq!(store.get("k").await.expect("get"), Some(2));

        clock.advance(Duration::from_secs(60));
        assert_eq!(store.get("k").await.expect("get"), None);
        assert_eq!(store.incr_and_expire("k", 60).await.expect("incr"), 1);
    }

    #[tokio::test]
    async fn memory_recent_keeps_newest_in_order() {
        let (_clock, store) = memory();
        for value in ["a", "b", "c", "d"] {
            store
                .push_recent("spam", value, 3, 3600)
                .await
                .expect("push");
        }
        assert_eq!(store.recent("spam").await.expect("recent"), vec!["b", "c", "d"]);
        store
            .delete(&["spam".to_string()])
            .await
            .expect("delete");
        assert!(store.recent("spam").await.expect("recent").is_empty());
    }

    #[tokio::test]
    async fn memory_set_with_expiry_round_trips() {
        let (clock, store) = memory();
        store
            .set_with_expiry("last", 42, 1)
            .await
            .expect("set");
        assert_eq!(store.get("last").await.expect("get"), Some(42));
        clock.advance(Duration::from_millis(1_001));
        assert_eq!(store.get("last").await.expect("get"), None);
    }

    #[tokio::test]
    async fn memory_store_sweeps_rolled_over_windows() {
        let clock = Arc::new(ManualClock::new(1_700_000_040_000));
        let backend = Arc::new(MemoryCounterStore::new(clock.clone()));
        let store = DualBackendCounterStore::new(backend.clone(), clock.clone());

        for _ in 0..2_000 {
            let now_ms = clock.now_epoch_millis();
            store.record_accept("u1", now_ms).await.expect("accept");
            store
                .record_fingerprint("u1", "hello", 5)
                .await
                .expect("fingerprint");
            clock.advance(Duration::from_secs(60));
        }

        // Live keys: a couple of minute and hour buckets, the cooldown mark
        // and the fingerprint list.
        assert!(backend.len() <= 6, "entries = {}", backend.len());
    }

    #[tokio::test]
    async fn memory_delete_prefix_only_touches_matching_keys() {
        let (_clock, store) = memory();
        store.incr_and_expire("ratelimit:u1:minute:1", 60).await.expect("incr");
        store.incr_and_expire("ratelimit:u1:hour:1", 3600).await.expect("incr");
        store.incr_and_expire("ratelimit:u10:minute:1", 60).await.expect("incr");

        assert_eq!(store.delete_prefix("ratelimit:u1:").await.expect("delete"), 2);
        assert_eq!(store.get("ratelimit:u10:minute:1").await.expect("get"), Some(1));
    }

    #[tokio::test]
    async fn dual_store_snapshot_reflects_writes() {
        let clock = Arc::new(ManualClock::new(120_000));
        let store = DualBackendCounterStore::in_memory(clock.clone());

        let empty = store.snapshot("u1").await.expect("snapshot");
        assert_eq!(empty.minute_count, 0);
        assert_eq!(empty.last_request_at_ms, None);

        let counts = store.record_accept("u1", 120_000).await.expect("accept");
        assert_eq!(counts, WindowCounts { minute: 1, hour: 1 });
        store
            .record_fingerprint("u1", "hi", 5)
            .await
            .expect("fingerprint");

        let cached = store.snapshot("u1").await.expect("snapshot");
        assert_eq!(cached.minute_count, 1);
        assert_eq!(cached.last_request_at_ms, Some(120_000));
        assert_eq!(cached.recent_fingerprints, vec!["hi".to_string()]);
    }

    #[tokio::test]
    async fn dual_store_cache_expires_after_ttl() {
        let clock = Arc::new(ManualClock::new(120_000));
        let backend: Arc<dyn CounterStore> = Arc::new(MemoryCounterStore::new(clock.clone()));
        let store = DualBackendCounterStore::new(backend.clone(), clock.clone())
            .with_cache_ttl(Duration::from_secs(5));

        store.snapshot("u1").await.expect("prime cache");
        let key = store.key_window("u1", WindowKind::Minute, WindowKind::Minute.bucket(120_000));
        backend.incr_and_expire(&key, 60).await.expect("other process");
        backend.incr_and_expire(&key, 60).await.expect("other process");

        assert_eq!(store.snapshot("u1").await.expect("cached").minute_count, 0);
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.snapshot("u1").await.expect("refreshed").minute_count, 2);
    }

    #[tokio::test]
    async fn dual_store_clear_subject_removes_keys() {
        let clock = Arc::new(ManualClock::new(179_000));
        let backend = Arc::new(MemoryCounterStore::new(clock.clone()));
        let store = DualBackendCounterStore::new(backend.clone(), clock.clone());
        store.record_accept("u1", 179_000).await.expect("accept");
        // Next minute bucket; the previous one has not expired yet.
        clock.advance(Duration::from_millis(1_500));
        store
            .record_accept("u1", clock.now_epoch_millis())
            .await
            .expect("accept");

        store.clear_subject("u1").await.expect("clear");
        let snapshot = store.snapshot("u1").await.expect("snapshot");
        assert_eq!(snapshot.hour_count, 0);
        assert_eq!(snapshot.last_request_at_ms, None);
        assert!(backend.is_empty(), "entries = {}", backend.len());
    }

    #[tokio::test]
    async fn dual_store_history_round_trips_entries() {
        let clock = Arc::new(ManualClock::new(120_000));
        let store = DualBackendCounterStore::in_memory(clock);
        for (i, role) in [Role::Caller, Role::Model, Role::Caller].into_iter().enumerate() {
            let entry = ContextEntry {
                role,
                text: format!("m{i}"),
                timestamp_ms: i as u64,
            };
            store.record_history("u1", &entry, 2).await.expect("record");
        }

        let history = store.history("u1").await.expect("history");
        let texts: Vec<_> = history.iter().map(|entry| entry.text.as_str()).collect();
        assert_eq!(texts, vec!["m1", "m2"]);
        assert_eq!(history[0].role, Role::Model);

        store.clear_history("u1").await.expect("clear");
        assert!(store.history("u1").await.expect("history").is_empty());
    }

    #[test]
    fn backend_config_parses_and_redacts() {
        let config: CounterBackendConfig = serde_json::from_value(serde_json::json!({
            "kind": "redis",
            "url": "redis://:hunter2@localhost:6379"
        }))
        .expect("parse");
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));

        let default: CounterBackendConfig = serde_json::from_value(serde_json::json!({
            "kind": "memory"
        }))
        .expect("parse");
        assert!(matches!(default, CounterBackendConfig::Memory));
    }
}
