//! Injectable time source.
//!
//! Every time-dependent component (breaker, bucket, cache, retry loop) reads
//! time and sleeps through a [`Clock`], so tests can drive them with a
//! [`ManualClock`] instead of real sleeps.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::lock_unpoisoned;

/// Source of monotonic time plus an async sleeper.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;

    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Wall clock backed by `Instant::now` and `tokio::time::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

#[derive(Debug, Default)]
struct ManualInner {
    offset: Duration,
    sleeps: Vec<Duration>,
}

/// Clock that only moves when advanced explicitly or slept on.
///
/// Sleeping completes immediately and advances the clock by the requested
/// duration. Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    inner: Arc<Mutex<ManualInner>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            inner: Arc::new(Mutex::new(ManualInner::default())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.offset += by;
    }

    /// Time elapsed on this clock since it was created.
    pub fn elapsed(&self) -> Duration {
        lock_unpoisoned(&self.inner).offset
    }

    /// Every duration passed to [`Clock::sleep`], in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        lock_unpoisoned(&self.inner).sleeps.clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + lock_unpoisoned(&self.inner).offset
    }

    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.sleeps.push(duration);
            inner.offset += duration;
        }
        Box::pin(std::future::ready(()))
    }
}
