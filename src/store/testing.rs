//! Store doubles for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{CounterStore, InMemoryStore, StoreError};

/// Wraps an [`InMemoryStore`] and counts every call made against it.
#[derive(Debug, Default)]
pub(crate) struct CountingStore {
    inner: InMemoryStore,
    calls: AtomicUsize,
}

impl CountingStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn record(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CounterStore for CountingStore {
    async fn increment(&self, key: &str, by: u64, ttl_if_new: Duration) -> Result<u64, StoreError> {
        self.record();
        self.inner.increment(key, by, ttl_if_new).await
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.record();
        self.inner.get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: u64, ttl: Duration) -> Result<bool, StoreError> {
        self.record();
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn set_if_absent_and_expire(
        &self,
        key: &str,
        value: u64,
        ttl: Duration,
        expire_key: &str,
    ) -> Result<bool, StoreError> {
        self.record();
        self.inner.set_if_absent_and_expire(key, value, ttl, expire_key).await
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        self.record();
        self.inner.remaining_ttl(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.record();
        self.inner.delete(key).await
    }
}

/// Wraps an [`InMemoryStore`] and delays the answer to every block marker
/// lookup, so concurrent consumers can all pass the block check before any
/// of them increments.
#[derive(Debug, Default)]
pub(crate) struct SlowBlockLookupStore {
    inner: InMemoryStore,
    delay: Duration,
}

impl SlowBlockLookupStore {
    pub(crate) fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStore::new(),
            delay,
        })
    }
}

#[async_trait]
impl CounterStore for SlowBlockLookupStore {
    async fn increment(&self, key: &str, by: u64, ttl_if_new: Duration) -> Result<u64, StoreError> {
        self.inner.increment(key, by, ttl_if_new).await
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.inner.get(key).await
    }

    async fn set_if_absent(&self, key: &str, value: u64, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn set_if_absent_and_expire(
        &self,
        key: &str,
        value: u64,
        ttl: Duration,
        expire_key: &str,
    ) -> Result<bool, StoreError> {
        self.inner.set_if_absent_and_expire(key, value, ttl, expire_key).await
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let ttl = self.inner.remaining_ttl(key).await;
        if key.contains(":block:") {
            tokio::time::sleep(self.delay).await;
        }
        ttl
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

/// Fails every call, as if the store were unreachable.
#[derive(Debug, Default)]
pub(crate) struct UnavailableStore;

impl UnavailableStore {
    fn error() -> StoreError {
        StoreError::Unavailable("connection refused".to_string())
    }
}

#[async_trait]
impl CounterStore for UnavailableStore {
    async fn increment(&self, _key: &str, _by: u64, _ttl: Duration) -> Result<u64, StoreError> {
        Err(Self::error())
    }

    async fn get(&self, _key: &str) -> Result<Option<u64>, StoreError> {
        Err(Self::error())
    }

    async fn set_if_absent(&self, _key: &str, _value: u64, _ttl: Duration) -> Result<bool, StoreError> {
        Err(Self::error())
    }

    async fn set_if_absent_and_expire(
        &self,
        _key: &str,
        _value: u64,
        _ttl: Duration,
        _expire_key: &str,
    ) -> Result<bool, StoreError> {
        Err(Self::error())
    }

    async fn remaining_ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
        Err(Self::error())
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Err(Self::error())
    }
}

/// Never answers within any reasonable timeout.
#[derive(Debug, Default)]
pub(crate) struct StalledStore;

impl StalledStore {
    async fn stall() {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[async_trait]
impl CounterStore for StalledStore {
    async fn increment(&self, _key: &str, _by: u64, _ttl: Duration) -> Result<u64, StoreError> {
        Self::stall().await;
        Ok(0)
    }

    async fn get(&self, _key: &str) -> Result<Option<u64>, StoreError> {
        Self::stall().await;
        Ok(None)
    }

    async fn set_if_absent(&self, _key: &str, _value: u64, _ttl: Duration) -> Result<bool, StoreError> {
        Self::stall().await;
        Ok(false)
    }

    async fn set_if_absent_and_expire(
        &self,
        _key: &str,
        _value: u64,
        _ttl: Duration,
        _expire_key: &str,
    ) -> Result<bool, StoreError> {
        Self::stall().await;
        Ok(false)
    }

    async fn remaining_ttl(&self, _key: &str) -> Result<Option<Duration>, StoreError> {
        Self::stall().await;
        Ok(None)
    }

    async fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Self::stall().await;
        Ok(())
    }
}
