//! Limiter policy values.

use std::time::Duration;

use crate::error::{QuotagateError, Result};

/// An immutable rate limit policy: `capacity` points per `window`, then a
/// `block` cooldown once the window's quota is exhausted.
///
/// A zero `block` disables blocking; the window's own expiry then governs
/// when the key may retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LimiterPolicy {
    capacity: u64,
    window: Duration,
    block: Duration,
}

impl LimiterPolicy {
    /// Create a policy, rejecting a zero capacity or an empty window.
    pub fn new(capacity: u64, window: Duration, block: Duration) -> Result<Self> {
        if capacity == 0 {
            return Err(QuotagateError::InvalidPolicy(
                "capacity must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(QuotagateError::InvalidPolicy(
                "window must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            capacity,
            window,
            block,
        })
    }

    /// Create a policy from fractional second values, as found in configuration.
    pub fn from_secs(capacity: u64, window_secs: f64, block_secs: f64) -> Result<Self> {
        let window = Duration::try_from_secs_f64(window_secs).map_err(|e| {
            QuotagateError::InvalidPolicy(format!("window_secs {}: {}", window_secs, e))
        })?;
        let block = Duration::try_from_secs_f64(block_secs).map_err(|e| {
            QuotagateError::InvalidPolicy(format!("block_secs {}: {}", block_secs, e))
        })?;
        Self::new(capacity, window, block)
    }

    /// Points available per window.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Length of one window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Cooldown imposed after the quota is exceeded.
    pub fn block(&self) -> Duration {
        self.block
    }

    /// Whether exhausting the quota imposes a block.
    pub fn blocks(&self) -> bool {
        !self.block.is_zero()
    }

    /// The part of the policy that identifies a shared limiter.
    pub(crate) fn identity(&self) -> (u64, Duration) {
        (self.capacity, self.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_secs() {
        let policy = LimiterPolicy::from_secs(2000, 1.0, 40.0).unwrap();
        assert_eq!(policy.capacity(), 2000);
        assert_eq!(policy.window(), Duration::from_secs(1));
        assert_eq!(policy.block(), Duration::from_secs(40));
        assert!(policy.blocks());
    }

    #[test]
    fn test_policy_fractional_window() {
        let policy = LimiterPolicy::from_secs(10, 0.5, 0.0).unwrap();
        assert_eq!(policy.window(), Duration::from_millis(500));
        assert!(!policy.blocks());
    }

    #[test]
    fn test_policy_rejects_invalid_values() {
        assert!(matches!(
            LimiterPolicy::from_secs(0, 1.0, 40.0),
            Err(QuotagateError::InvalidPolicy(_))
        ));
        assert!(LimiterPolicy::from_secs(10, 0.0, 40.0).is_err());
        assert!(LimiterPolicy::from_secs(10, -1.0, 40.0).is_err());
        assert!(LimiterPolicy::from_secs(10, 1.0, -5.0).is_err());
        assert!(LimiterPolicy::from_secs(10, f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_identity_ignores_block() {
        let a = LimiterPolicy::from_secs(5, 1.0, 40.0).unwrap();
        let b = LimiterPolicy::from_secs(5, 1.0, 10.0).unwrap();
        assert_eq!(a.identity(), b.identity());
        assert_ne!(a, b);
    }
}
