//! Store key generation for rate limit records.

use std::fmt;

use super::policy::LimiterPolicy;

/// The store namespace owned by one limiter policy.
///
/// Keys are composed of a deployment prefix, the policy's capacity and its
/// window in seconds, so two policies never share a record even when the
/// client keys coincide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyNamespace {
    /// Deployment-wide key prefix
    pub prefix: String,
    /// Policy capacity
    pub capacity: u64,
    /// Policy window, rendered as the shortest decimal number of seconds
    pub window: String,
}

impl PolicyNamespace {
    /// Create the namespace for a policy under the given prefix.
    pub fn new(prefix: &str, policy: &LimiterPolicy) -> Self {
        Self {
            prefix: prefix.to_string(),
            capacity: policy.capacity(),
            window: policy.window().as_secs_f64().to_string(),
        }
    }

    /// Key of the window counter for `client_key`.
    pub fn counter_key(&self, client_key: &str) -> String {
        format!("{}:{}", self, client_key)
    }

    /// Key of the block marker for `client_key`.
    ///
    /// The `block` segment sits where counters carry the numeric capacity,
    /// so block markers and counters can never collide.
    pub fn block_key(&self, client_key: &str) -> String {
        format!("{}:block:{}:{}:{}", self.prefix, self.capacity, self.window, client_key)
    }
}

impl fmt::Display for PolicyNamespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.prefix, self.capacity, self.window)
    }
}
