use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::lock_unpoisoned;

/// Token bucket capacity and refill rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    pub capacity: f64,
    pub refill_rate_per_second: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            capacity: 60.0,
            refill_rate_per_second: 1.0,
        }
    }
}

/// Point-in-time view of the local request budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub available: f64,
    pub capacity: f64,
    pub refill_rate_per_second: f64,
}

impl RateLimitStatus {
    pub fn has_capacity(&self) -> bool {
        self.available >= 1.0
    }
}

#[derive(Debug)]
struct BucketInner {
    available: f64,
    last_refill: Instant,
}

/// Local admission control for an upstream with a request quota.
///
/// Refill is computed lazily from elapsed time on every call; nothing runs in
/// the background. Callers that are refused decide for themselves whether to
/// wait, serve cached data, or fail.
#[derive(Debug)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BucketInner>,
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(TokenBucketConfig::default())
    }
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Starts full.
    pub fn with_clock(config: TokenBucketConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.capacity.max(0.0);
        let now = clock.now();
        Self {
            config: TokenBucketConfig {
                capacity,
                refill_rate_per_second: config.refill_rate_per_second.max(0.0),
            },
            clock,
            inner: Mutex::new(BucketInner {
                available: capacity,
                last_refill: now,
            }),
        }
    }

    pub fn config(&self) -> TokenBucketConfig {
        self.config
    }

    /// Consumes `n` tokens if they are all available. On refusal the bucket is
    /// left untouched apart from the refill.
    pub fn try_consume(&self, n: u32) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        self.refill(&mut inner);

        let wanted = f64::from(n);
        if inner.available >= wanted {
            inner.available -= wanted;
            true
        } else {
            false
        }
    }

    /// Remaining tokens after refill, without consuming any.
    pub fn peek(&self) -> f64 {
        let mut inner = lock_unpoisoned(&self.inner);
        self.refill(&mut inner);
        inner.available
    }

    pub fn status(&self) -> RateLimitStatus {
        RateLimitStatus {
            available: self.peek(),
            capacity: self.config.capacity,
            refill_rate_per_second: self.config.refill_rate_per_second,
        }
    }

    /// Time until `n` tokens will be available. `None` if `n` can never fit
    /// or the wait is too long to represent as a `Duration`.
    pub fn time_until_available(&self, n: u32) -> Option<Duration> {
        let wanted = f64::from(n);
        if wanted > self.config.capacity {
            return None;
        }

        let available = self.peek();
        if available >= wanted {
            return Some(Duration::ZERO);
        }
        if self.config.refill_rate_per_second <= 0.0 {
            return None;
        }

        let seconds = (wanted - available) / self.config.refill_rate_per_second;
        Duration::try_from_secs_f64(seconds).ok()
    }

    /// Refills the bucket to capacity.
    pub fn reset(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.available = self.config.capacity;
        inner.last_refill = self.clock.now();
    }

    fn refill(&self, inner: &mut BucketInner) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(inner.last_refill).as_secs_f64();
        let refilled = inner.available + elapsed * self.config.refill_rate_per_second;

        inner.available = refilled.clamp(0.0, self.config.capacity);
        if now > inner.last_refill {
            inner.last_refill = now;
        }
    }
}
