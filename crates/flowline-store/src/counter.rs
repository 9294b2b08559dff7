//! Distributed counter store used by the admission gates.
//!
//! A key-value store with atomic numeric operations is all the gates
//! need. Every operation is a single atomic read-modify-write - a
//! separate read-then-write would race under concurrent admission
//! checks. Production deployments back this with a shared store
//! (e.g. Redis pipelines); the in-memory adapter keeps the same
//! atomicity guarantees behind one mutex.

use crate::{StoreError, StoreResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Atomic counter/marker operations with optional expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment a counter, setting/refreshing its expiry,
    /// and return the new value.
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StoreResult<i64>;

    /// Atomically decrement a counter, clamping at zero, and return
    /// the new value. Missing keys stay at zero.
    async fn decrement_floor(&self, key: &str) -> StoreResult<i64>;

    /// Current value; missing or expired keys read as zero.
    async fn get(&self, key: &str) -> StoreResult<i64>;

    /// Record a marker key with an expiry.
    async fn put_marker(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Atomically delete a marker, reporting whether it existed.
    async fn take_marker(&self, key: &str) -> StoreResult<bool>;

    /// Administrative: delete every key under a prefix. Returns the
    /// number of keys removed.
    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64>;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// In-memory counter store. A single mutex makes every operation an
/// atomic unit; expiry is applied lazily on access.
#[derive(Default)]
pub struct InMemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("counter lock poisoned".to_string()))
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Option<Duration>) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entries = self.lock()?;

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });
        if !entry.live(now) {
            entry.value = 0;
        }
        entry.value += 1;
        entry.expires_at = ttl.map(|t| now + t);
        Ok(entry.value)
    }

    async fn decrement_floor(&self, key: &str) -> StoreResult<i64> {
        let now = Instant::now();
        let mut entries = self.lock()?;

        match entries.get_mut(key) {
            Some(entry) if entry.live(now) => {
                entry.value = (entry.value - 1).max(0);
                Ok(entry.value)
            }
            _ => {
                entries.remove(key);
                Ok(0)
            }
        }
    }

    async fn get(&self, key: &str) -> StoreResult<i64> {
        let now = Instant::now();
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|e| e.live(now))
            .map(|e| e.value)
            .unwrap_or(0))
    }

    async fn put_marker(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            Entry {
                value: 1,
                expires_at: Some(now + ttl),
            },
        );
        Ok(())
    }

    async fn take_marker(&self, key: &str) -> StoreResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        match entries.remove(key) {
            Some(entry) => Ok(entry.live(now)),
            None => Ok(false),
        }
    }

    async fn clear_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        Ok((before - entries.len()) as u64)
    }
}
