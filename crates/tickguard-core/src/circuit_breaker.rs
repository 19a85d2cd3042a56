use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::{duration_ms, lock_unpoisoned};

/// Runtime circuit state for upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Open => "OPEN",
            Self::HalfOpen => "HALF_OPEN",
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Status report for operational visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Time since the most recent recorded failure.
    pub since_last_failure_ms: Option<u64>,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
        }
    }
}

/// Thread-safe circuit breaker guarding one upstream endpoint.
///
/// While half-open every caller is let through; the first recorded outcome
/// decides the next state and later outcomes re-correct it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            clock,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub fn allow(&self) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let now = self.clock.now();
                let can_probe = inner
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at) >= self.config.reset_timeout)
                    .unwrap_or(true);

                if can_probe {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!(
                        consecutive_failures = inner.consecutive_failures,
                        "circuit half-open, probing upstream"
                    );
                }
                can_probe
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        match inner.state {
            // Late result from a probe racing the re-open; the newer failure wins.
            CircuitState::Open => {}
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                tracing::info!("circuit closed after successful probe");
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
        }
    }

    pub fn on_failure(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure_at = Some(self.clock.now());

        let trips = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trips {
            tracing::warn!(
                from = %inner.state,
                consecutive_failures = inner.consecutive_failures,
                reset_timeout_ms = duration_ms(self.config.reset_timeout),
                "circuit opened"
            );
            inner.state = CircuitState::Open;
        }
    }

    pub fn state(&self) -> CircuitState {
        lock_unpoisoned(&self.inner).state
    }

    pub fn consecutive_failures(&self) -> u32 {
        lock_unpoisoned(&self.inner).consecutive_failures
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = lock_unpoisoned(&self.inner);
        let now = self.clock.now();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: duration_ms(self.config.reset_timeout),
            since_last_failure_ms: inner
                .last_failure_at
                .map(|at| duration_ms(now.saturating_duration_since(at))),
        }
    }

    /// Forces the breaker back to closed with a clean failure history.
    pub fn reset(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        *inner = CircuitInner::default();
    }
}
