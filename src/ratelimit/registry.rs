//! Limiter registry.
//!
//! The single place limiters are constructed. Endpoints that share a policy
//! share one [`Limiter`] and therefore one store namespace.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use super::key::PolicyNamespace;
use super::limiter::{Limiter, DEFAULT_STORE_TIMEOUT};
use super::policy::LimiterPolicy;
use crate::error::{QuotagateError, Result};
use crate::store::CounterStore;

/// Default prefix for every key the registry's limiters write.
pub const DEFAULT_KEY_PREFIX: &str = "rl";

/// Maps policies to shared [`Limiter`] instances.
///
/// Limiters are identified by capacity and window. The block duration is not
/// part of the identity, since it does not appear in the store namespace;
/// asking for an existing capacity and window with a different block
/// duration is a [`QuotagateError::PolicyConflict`].
pub struct LimiterRegistry {
    store: Arc<dyn CounterStore>,
    key_prefix: String,
    store_timeout: Duration,
    limiters: DashMap<(u64, Duration), Arc<Limiter>>,
}

impl LimiterRegistry {
    /// Create an empty registry whose limiters share `store`.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            limiters: DashMap::new(),
        }
    }

    /// Use `prefix` for the store keys of limiters created from now on.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Bound each store call made by created limiters.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Return the limiter for `policy`, creating it on first use.
    pub fn get_or_create(&self, policy: LimiterPolicy) -> Result<Arc<Limiter>> {
        let limiter = self
            .limiters
            .entry(policy.identity())
            .or_insert_with(|| {
                let namespace = PolicyNamespace::new(&self.key_prefix, &policy);
                debug!(
                    namespace = %namespace,
                    capacity = policy.capacity(),
                    window = ?policy.window(),
                    block = ?policy.block(),
                    "Creating limiter"
                );
                Arc::new(Limiter::new(
                    policy,
                    namespace,
                    self.store.clone(),
                    self.store_timeout,
                ))
            })
            .value()
            .clone();

        if limiter.policy().block() != policy.block() {
            return Err(QuotagateError::PolicyConflict(format!(
                "{} is registered with block {:?}, requested {:?}",
                limiter.namespace(),
                limiter.policy().block(),
                policy.block()
            )));
        }
        Ok(limiter)
    }

    /// All registered limiters, in no particular order.
    pub fn limiters(&self) -> Vec<Arc<Limiter>> {
        self.limiters.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Get the number of registered limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Returns `true` if no limiter has been created.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
