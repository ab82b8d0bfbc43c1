//! In-process counter store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CounterStore, StoreError};

/// Map size at which the first sweep of expired records runs.
const SWEEP_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Record {
    value: u64,
    expires_at: Instant,
}

impl Record {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug)]
struct Records {
    map: HashMap<String, Record>,
    /// Sweep once the map reaches this many entries.
    sweep_at: usize,
}

impl Default for Records {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
            sweep_at: SWEEP_THRESHOLD,
        }
    }
}

impl Records {
    fn live(&mut self, key: &str, now: Instant) -> Option<Record> {
        match self.map.get(key) {
            Some(record) if record.is_live(now) => Some(*record),
            Some(_) => {
                self.map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert `record`, first dropping every expired record if the map has
    /// grown past the sweep mark. The mark doubles with the live set, which
    /// keeps the cost of sweeping amortized over inserts.
    fn insert(&mut self, key: &str, record: Record, now: Instant) {
        if !self.map.contains_key(key) && self.map.len() >= self.sweep_at {
            self.map.retain(|_, r| r.is_live(now));
            self.sweep_at = SWEEP_THRESHOLD.max(self.map.len() * 2);
        }
        self.map.insert(key.to_string(), record);
    }
}

/// A [`CounterStore`] held in local memory.
///
/// State is not shared between processes, so this is only correct for a
/// single instance. Expired records are dropped when next read, and in bulk
/// whenever new keys grow the map past a sweep mark. Time is read from
/// `tokio::time`, which lets tests pause and advance the clock.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<Records>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.records.lock().map.values().filter(|r| r.is_live(now)).count()
    }

    /// Returns `true` if the store holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of records held, expired or not.
    #[cfg(test)]
    fn held(&self) -> usize {
        self.records.lock().map.len()
    }
}

#[async_trait]
impl CounterStore for InMemoryStore {
    async fn increment(&self, key: &str, by: u64, ttl_if_new: Duration) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut records = self.records.lock();

        let record = match records.live(key, now) {
            Some(existing) => Record {
                value: existing.value.saturating_add(by),
                expires_at: existing.expires_at,
            },
            None => Record {
                value: by,
                expires_at: now + ttl_if_new,
            },
        };
        records.insert(key, record, now);
        Ok(record.value)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let mut records = self.records.lock();
        Ok(records.live(key, Instant::now()).map(|r| r.value))
    }

    async fn set_if_absent(&self, key: &str, value: u64, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut records = self.records.lock();

        if records.live(key, now).is_some() {
            return Ok(false);
        }
        records.insert(
            key,
            Record {
                value,
                expires_at: now + ttl,
            },
            now,
        );
        Ok(true)
    }

    async fn set_if_absent_and_expire(
        &self,
        key: &str,
        value: u64,
        ttl: Duration,
        expire_key: &str,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut records = self.records.lock();

        if records.live(key, now).is_some() {
            return Ok(false);
        }
        let expires_at = now + ttl;
        records.insert(key, Record { value, expires_at }, now);
        if let Some(mut linked) = records.live(expire_key, now) {
            linked.expires_at = expires_at;
            records.map.insert(expire_key.to_string(), linked);
        }
        Ok(true)
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let now = Instant::now();
        let mut records = self.records.lock();
        Ok(records.live(key, now).map(|r| r.expires_at - now))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.records.lock().map.remove(key);
        Ok(())
    }
}
