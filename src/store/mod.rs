//! Shared counter store.
//!
//! Every server instance talks to the same store, so all rate limit state
//! lives there and nothing is cached in-process. The [`CounterStore`] trait
//! is the seam between the limiter and the backend: [`RedisStore`] for
//! production fleets and [`InMemoryStore`] for tests and single-instance runs.
//!
//! Implementations are thin, fail-fast adapters. They never retry; a failed
//! call surfaces as a [`StoreError`] and the caller decides what to do.

mod memory;
mod redis_store;

#[cfg(test)]
pub(crate) mod testing;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

/// Errors that can occur talking to the counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Atomic counter operations against a shared key-value store.
///
/// All operations must be atomic with respect to concurrent callers on every
/// server instance. TTLs are enforced by the store itself.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Add `by` to the counter at `key` and return the new value.
    ///
    /// A missing counter is created with `ttl_if_new`. An existing counter
    /// keeps its current expiry.
    async fn increment(&self, key: &str, by: u64, ttl_if_new: Duration) -> Result<u64, StoreError>;

    /// Read the counter at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Write `value` at `key` with `ttl` unless a live record already exists.
    ///
    /// Returns `true` if this call created the record. An existing record is
    /// left untouched, including its expiry.
    async fn set_if_absent(&self, key: &str, value: u64, ttl: Duration) -> Result<bool, StoreError>;

    /// [`set_if_absent`](Self::set_if_absent) that, when it creates the
    /// record, also moves `expire_key` to the same expiry.
    ///
    /// Both writes happen as one atomic step, so the two records expire
    /// together. A missing `expire_key` is left missing.
    async fn set_if_absent_and_expire(
        &self,
        key: &str,
        value: u64,
        ttl: Duration,
        expire_key: &str,
    ) -> Result<bool, StoreError>;

    /// Time left before `key` expires, or `None` if absent.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
