//! Rate limiting of share password attempts per client and token

use crate::error::{KeywardError, Result};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use std::num::NonZeroU32;

type KeyedRateLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Token-bucket limiter keyed by `client:token`
pub struct AccessLimiter {
    limiter: KeyedRateLimiter,
}

impl AccessLimiter {
    /// Allow `attempts_per_minute` attempts, refilling evenly over a minute
    pub fn per_minute(attempts_per_minute: u32) -> Result<Self> {
        let attempts = NonZeroU32::new(attempts_per_minute).ok_or_else(|| {
            KeywardError::Config("access attempts per minute must be at least 1".to_string())
        })?;
        Ok(Self {
            limiter: RateLimiter::keyed(Quota::per_minute(attempts)),
        })
    }

    /// Consume one attempt, failing with `RateLimited` when the bucket is empty
    pub fn check(&self, client: &str, token: &str) -> Result<()> {
        self.limiter
            .check_key(&format!("{}:{}", client, token))
            .map_err(|_| KeywardError::RateLimited)
    }

    /// Drop buckets that have fully refilled
    pub fn prune(&self) {
        self.limiter.retain_recent();
    }

    /// Number of tracked buckets
    pub fn tracked(&self) -> usize {
        self.limiter.len()
    }
}

impl std::fmt::Debug for AccessLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessLimiter")
            .field("tracked", &self.tracked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_per_client_and_token() {
        let limiter = AccessLimiter::per_minute(3).unwrap();
        for _ in 0..3 {
            limiter.check("10.0.0.1", "tok").unwrap();
        }
        assert!(matches!(
            limiter.check("10.0.0.1", "tok"),
            Err(KeywardError::RateLimited)
        ));

        // Separate buckets for another client or another token
        limiter.check("10.0.0.2", "tok").unwrap();
        limiter.check("10.0.0.1", "other").unwrap();
        assert_eq!(limiter.tracked(), 3);
    }

    #[test]
    fn test_zero_rejected() {
        assert!(AccessLimiter::per_minute(0).is_err());
    }
}
