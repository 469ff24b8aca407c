//! Per-pool token bucket.
//!
//! Thin wrapper over governor's direct rate limiter: refill at
//! `per_second`, capacity `burst`. Acquisition is non-blocking; a missing
//! or zero rate disables limiting entirely.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use relay_core::RateLimitConfig;

pub struct PoolRateLimiter {
    limiter: Option<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    config: Option<RateLimitConfig>,
}

impl PoolRateLimiter {
    pub fn new(config: Option<RateLimitConfig>) -> Self {
        let limiter = config.as_ref().and_then(|cfg| {
            let rate = NonZeroU32::new(cfg.per_second)?;
            let burst = NonZeroU32::new(cfg.burst_capacity())?;
            Some(RateLimiter::direct(
                Quota::per_second(rate).allow_burst(burst),
            ))
        });

        Self { limiter, config }
    }

    /// Take one token without waiting. Always succeeds when disabled.
    pub fn try_acquire(&self) -> bool {
        match self.limiter {
            Some(ref limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.limiter.is_some()
    }

    pub fn config(&self) -> Option<RateLimitConfig> {
        self.config
    }
}
