//! Core rate limiter implementation.
//!
//! A fixed-window limiter whose state lives entirely in the shared
//! [`CounterStore`]. Each consumption is an atomic increment on the store;
//! exhausting the window writes a block marker that rejects the key until it
//! expires.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, trace};

use super::key::PolicyNamespace;
use super::policy::LimiterPolicy;
use crate::store::{CounterStore, StoreError};

/// Default upper bound on a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(300);

/// Errors returned by [`Limiter`] operations.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// The counter store failed or did not answer in time.
    #[error("counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    /// A consumption of zero points was requested.
    #[error("points to consume must be at least 1")]
    InvalidPoints,
}

/// Why a consumption was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// This consumption pushed the window past its capacity.
    QuotaExceeded,
    /// The key is serving a block from an earlier exhaustion.
    BlockActive,
}

/// The outcome of a consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Points left in the current window
    pub remaining_points: u64,
    /// Milliseconds until the quota becomes available again
    pub ms_before_next: u64,
    /// Points counted in the current window, including this consumption
    pub consumed_points: u64,
    /// Set when `allowed` is false
    pub rejection: Option<Rejection>,
}

impl ConsumeResult {
    fn allowed(consumed_points: u64, remaining_points: u64, ms_before_next: u64) -> Self {
        Self {
            allowed: true,
            remaining_points,
            ms_before_next,
            consumed_points,
            rejection: None,
        }
    }

    fn rejected(rejection: Rejection, consumed_points: u64, ms_before_next: u64) -> Self {
        Self {
            allowed: false,
            remaining_points: 0,
            ms_before_next,
            consumed_points,
            rejection: Some(rejection),
        }
    }

    /// Whole seconds a rejected caller should wait, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        self.ms_before_next.div_ceil(1000)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A fixed-window limiter for one [`LimiterPolicy`].
///
/// Limiters hold no counters of their own, only the policy, its store
/// namespace and a handle to the shared store. Obtain them from
/// [`LimiterRegistry`](super::LimiterRegistry) so that one policy maps to one
/// instance.
pub struct Limiter {
    policy: LimiterPolicy,
    namespace: PolicyNamespace,
    store: Arc<dyn CounterStore>,
    store_timeout: Duration,
}

impl Limiter {
    /// Create a limiter for `policy` whose keys live under `namespace`.
    pub fn new(
        policy: LimiterPolicy,
        namespace: PolicyNamespace,
        store: Arc<dyn CounterStore>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            policy,
            namespace,
            store,
            store_timeout,
        }
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> &LimiterPolicy {
        &self.policy
    }

    /// The store namespace this limiter's keys live under.
    pub fn namespace(&self) -> &PolicyNamespace {
        &self.namespace
    }

    /// Consume one point for `key`.
    pub async fn consume(&self, key: &str) -> Result<ConsumeResult, LimiterError> {
        self.consume_points(key, 1).await
    }

    /// Consume `points` for `key`.
    ///
    /// Consumed points are never refunded, even if the caller later abandons
    /// the request.
    pub async fn consume_points(&self, key: &str, points: u64) -> Result<ConsumeResult, LimiterError> {
        if points == 0 {
            return Err(LimiterError::InvalidPoints);
        }

        let block_key = self.namespace.block_key(key);
        let counter_key = self.namespace.counter_key(key);
        let capacity = self.policy.capacity();

        trace!(
            namespace = %self.namespace,
            key = %key,
            points = points,
            "Consuming points"
        );

        if let Some(left) = self.call(self.store.remaining_ttl(&block_key)).await? {
            return Ok(ConsumeResult::rejected(
                Rejection::BlockActive,
                capacity,
                millis(left),
            ));
        }

        let count = self
            .call(self.store.increment(&counter_key, points, self.policy.window()))
            .await?;

        if count <= capacity {
            let left = self
                .call(self.store.remaining_ttl(&counter_key))
                .await?
                .unwrap_or(self.policy.window());
            return Ok(ConsumeResult::allowed(count, capacity - count, millis(left)));
        }

        debug!(
            namespace = %self.namespace,
            key = %key,
            count = count,
            capacity = capacity,
            "Rate limit exceeded"
        );

        if !self.policy.blocks() {
            let left = self
                .call(self.store.remaining_ttl(&counter_key))
                .await?
                .unwrap_or(Duration::ZERO);
            return Ok(ConsumeResult::rejected(
                Rejection::QuotaExceeded,
                count,
                millis(left),
            ));
        }

        // The exhausted counter stays and takes the block's expiry. Both
        // records end together.
        let established = self
            .call(self.store.set_if_absent_and_expire(
                &block_key,
                count,
                self.policy.block(),
                &counter_key,
            ))
            .await?;
        if established {
            debug!(
                namespace = %self.namespace,
                key = %key,
                block_ms = millis(self.policy.block()),
                "Block established"
            );
        }

        Ok(ConsumeResult::rejected(
            Rejection::QuotaExceeded,
            count,
            millis(self.policy.block()),
        ))
    }

    /// Inspect the state of `key` without consuming.
    ///
    /// Returns `None` when the key has neither a live window nor a block.
    pub async fn get(&self, key: &str) -> Result<Option<ConsumeResult>, LimiterError> {
        let block_key = self.namespace.block_key(key);
        let counter_key = self.namespace.counter_key(key);
        let capacity = self.policy.capacity();

        if let Some(left) = self.call(self.store.remaining_ttl(&block_key)).await? {
            return Ok(Some(ConsumeResult::rejected(
                Rejection::BlockActive,
                capacity,
                millis(left),
            )));
        }

        let Some(count) = self.call(self.store.get(&counter_key)).await? else {
            return Ok(None);
        };
        let left = self
            .call(self.store.remaining_ttl(&counter_key))
            .await?
            .unwrap_or(Duration::ZERO);

        let result = if count <= capacity {
            ConsumeResult::allowed(count, capacity - count, millis(left))
        } else {
            ConsumeResult::rejected(Rejection::QuotaExceeded, count, millis(left))
        };
        Ok(Some(result))
    }

    /// Block `key` for `duration`, regardless of its window.
    ///
    /// An existing block is left as is. Returns `true` if this call set it.
    pub async fn block(&self, key: &str, duration: Duration) -> Result<bool, LimiterError> {
        let block_key = self.namespace.block_key(key);
        let established = self
            .call(self.store.set_if_absent(&block_key, self.policy.capacity().saturating_add(1), duration))
            .await?;

        debug!(
            namespace = %self.namespace,
            key = %key,
            block_ms = millis(duration),
            established = established,
            "Manual block requested"
        );
        Ok(established)
    }

    /// Forget all state for `key`: its window counter and any block.
    pub async fn delete(&self, key: &str) -> Result<(), LimiterError> {
        self.call(self.store.delete(&self.namespace.block_key(key))).await?;
        self.call(self.store.delete(&self.namespace.counter_key(key))).await?;
        Ok(())
    }

    /// Run one store call under the store timeout.
    async fn call<T, F>(&self, op: F) -> Result<T, LimiterError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.store_timeout).into()),
        }
    }
}

impl std::fmt::Debug for Limiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Limiter")
            .field("policy", &self.policy)
            .field("namespace", &self.namespace)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testing::{SlowBlockLookupStore, StalledStore, UnavailableStore};
    use crate::store::InMemoryStore;
    use tokio_test::{assert_err, assert_ok};

    fn create_test_limiter(capacity: u64, window_secs: f64, block_secs: f64) -> (Limiter, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let limiter = limiter_on(store.clone(), capacity, window_secs, block_secs);
        (limiter, store)
    }

    fn limiter_on(store: Arc<dyn CounterStore>, capacity: u64, window_secs: f64, block_secs: f64) -> Limiter {
        let policy = LimiterPolicy::from_secs(capacity, window_secs, block_secs).unwrap();
        let namespace = PolicyNamespace::new("rl", &policy);
        Limiter::new(policy, namespace, store, DEFAULT_STORE_TIMEOUT)
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_rapid_scenario() {
        let (limiter, store) = create_test_limiter(2, 1.0, 40.0);

        let first = limiter.consume("k").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining_points, 1);
        assert_eq!(first.ms_before_next, 1000);

        let second = limiter.consume("k").await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining_points, 0);

        let third = limiter.consume("k").await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining_points, 0);
        assert_eq!(third.rejection, Some(Rejection::QuotaExceeded));
        assert_eq!(third.ms_before_next, 40_000);
        assert_eq!(third.retry_after_secs(), 40);

        assert_eq!(
            store.remaining_ttl("rl:block:2:1:k").await.unwrap(),
            Some(Duration::from_secs(40))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_points_non_increasing() {
        let (limiter, _store) = create_test_limiter(5, 10.0, 0.0);

        let mut previous = u64::MAX;
        for _ in 0..8 {
            let result = limiter.consume("k").await.unwrap();
            assert!(result.remaining_points <= previous);
            previous = result.remaining_points;
        }
        assert_eq!(previous, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_ttl_never_extended() {
        let (limiter, _store) = create_test_limiter(1, 1.0, 40.0);

        assert!(limiter.consume("k").await.unwrap().allowed);
        assert!(!limiter.consume("k").await.unwrap().allowed);

        let mut previous = 40_000;
        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(5)).await;
            let result = limiter.consume("k").await.unwrap();
            assert!(!result.allowed);
            assert_eq!(result.rejection, Some(Rejection::BlockActive));
            assert!(result.ms_before_next < previous);
            previous = result.ms_before_next;
        }
        assert_eq!(previous, 15_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expiry_starts_new_window() {
        let (limiter, _store) = create_test_limiter(2, 60.0, 5.0);

        limiter.consume("k").await.unwrap();
        limiter.consume("k").await.unwrap();
        assert!(!limiter.consume("k").await.unwrap().allowed);

        tokio::time::advance(Duration::from_secs(5)).await;

        let result = limiter.consume("k").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.consumed_points, 1);
        assert_eq!(result.remaining_points, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_reset() {
        let (limiter, _store) = create_test_limiter(3, 1.0, 0.0);

        for _ in 0..3 {
            limiter.consume("k").await.unwrap();
        }
        tokio::time::advance(Duration::from_secs(1)).await;

        let result = limiter.consume("k").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining_points, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_disabled_uses_window_ttl() {
        let (limiter, store) = create_test_limiter(1, 10.0, 0.0);

        limiter.consume("k").await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        let result = limiter.consume("k").await.unwrap();
        assert!(!result.allowed);
        assert_eq!(result.rejection, Some(Rejection::QuotaExceeded));
        assert_eq!(result.ms_before_next, 7_000);
        assert_eq!(result.retry_after_secs(), 7);
        assert_eq!(store.get("rl:block:1:10:k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_policies_do_not_interfere() {
        let store = Arc::new(InMemoryStore::new());
        let strict = limiter_on(store.clone(), 1, 1.0, 40.0);
        let relaxed = limiter_on(store.clone(), 100, 1.0, 40.0);

        strict.consume("k").await.unwrap();
        assert!(!strict.consume("k").await.unwrap().allowed);

        let result = relaxed.consume("k").await.unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining_points, 99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_do_not_interfere() {
        let (limiter, _store) = create_test_limiter(1, 1.0, 40.0);

        limiter.consume("a").await.unwrap();
        assert!(!limiter.consume("a").await.unwrap().allowed);
        assert!(limiter.consume("b").await.unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_points() {
        let (limiter, _store) = create_test_limiter(10, 1.0, 40.0);

        let result = limiter.consume_points("k", 4).await.unwrap();
        assert_eq!(result.consumed_points, 4);
        assert_eq!(result.remaining_points, 6);

        let result = limiter.consume_points("k", 7).await.unwrap();
        assert!(!result.allowed);

        assert!(matches!(
            limiter.consume_points("k", 0).await,
            Err(LimiterError::InvalidPoints)
        ));
    }

    async fn count_allowed(limiter: Limiter, consumers: usize) -> usize {
        let limiter = Arc::new(limiter);
        let tasks = (0..consumers).map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.consume("k").await.unwrap() })
        });
        futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|r| r.allowed)
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_consumers_share_quota() {
        let (limiter, _store) = create_test_limiter(10, 1.0, 0.0);
        assert_eq!(count_allowed(limiter, 25).await, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_consumers_share_quota_with_block() {
        let (limiter, store) = create_test_limiter(10, 1.0, 40.0);
        assert_eq!(count_allowed(limiter, 25).await, 10);
        assert!(store.remaining_ttl("rl:block:10:1:k").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_racing_block_establishment_is_rejected() {
        let store = SlowBlockLookupStore::new(Duration::from_millis(100));
        let limiter = Arc::new(limiter_on(store.clone(), 1, 60.0, 40.0));

        assert!(limiter.consume("k").await.unwrap().allowed);

        // Both consumers pass the block check before either increments.
        let first = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.consume("k").await.unwrap() }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = tokio::spawn({
            let limiter = limiter.clone();
            async move { limiter.consume("k").await.unwrap() }
        });

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert!(!first.allowed);
        assert_eq!(first.rejection, Some(Rejection::QuotaExceeded));
        assert!(!second.allowed);
        assert_eq!(second.rejection, Some(Rejection::QuotaExceeded));
        assert_eq!(second.consumed_points, 3);

        // The counter shares the block's expiry instead of the window's.
        let counter_ttl = store.remaining_ttl("rl:1:60:k").await.unwrap().unwrap();
        assert!(counter_ttl <= Duration::from_secs(40));

        tokio::time::advance(Duration::from_secs(40)).await;
        let after = limiter.consume("k").await.unwrap();
        assert!(after.allowed);
        assert_eq!(after.consumed_points, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_does_not_consume() {
        let (limiter, _store) = create_test_limiter(3, 1.0, 40.0);

        assert_eq!(limiter.get("k").await.unwrap(), None);

        limiter.consume("k").await.unwrap();
        let peek = limiter.get("k").await.unwrap().unwrap();
        assert_eq!(peek.consumed_points, 1);
        assert_eq!(peek.remaining_points, 2);

        let again = limiter.get("k").await.unwrap().unwrap();
        assert_eq!(again.consumed_points, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_block_and_delete() {
        let (limiter, _store) = create_test_limiter(3, 1.0, 40.0);

        assert!(limiter.block("k", Duration::from_secs(10)).await.unwrap());
        assert!(!limiter.block("k", Duration::from_secs(99)).await.unwrap());

        let result = limiter.consume("k").await.unwrap();
        assert_eq!(result.rejection, Some(Rejection::BlockActive));
        assert_eq!(result.ms_before_next, 10_000);

        assert_ok!(limiter.delete("k").await);
        assert!(limiter.consume("k").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_store_failure_is_error() {
        let limiter = limiter_on(Arc::new(UnavailableStore), 2, 1.0, 40.0);

        let result = limiter.consume("k").await;
        assert!(matches!(result, Err(LimiterError::StoreUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_is_error() {
        let limiter = limiter_on(Arc::new(StalledStore), 2, 1.0, 40.0);

        let err = assert_err!(limiter.consume("k").await);
        assert!(matches!(
            err,
            LimiterError::StoreUnavailable(StoreError::Timeout(t)) if t == DEFAULT_STORE_TIMEOUT
        ));
    }
}
