//! Retry delays: exponential backoff with additive jitter, plus fixed and
//! linear schedules.

use std::time::Duration;

/// Wait schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same wait every time.
    Fixed { delay: Duration },
    /// Waits `step * (attempt + 1)`.
    Linear { step: Duration },
    /// The delay is `min(base * factor^attempt, max) + U[0, jitter)`. The
    /// jitter is added on top of the capped value and does not compound.
    Exponential {
        /// Wait before the first retry, ignoring jitter.
        base: Duration,
        factor: f64,
        /// Upper bound for the deterministic part of the delay.
        max: Duration,
        /// Exclusive upper bound of the uniformly random extra wait.
        jitter: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: Duration::from_secs(1),
        }
    }
}

impl Backoff {
    /// Wait after the failed attempt numbered `attempt`, counting from 0.
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Linear { step } => step.saturating_mul(attempt.saturating_add(1)),
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let scale = factor.powi(i32::try_from(attempt).unwrap_or(i32::MAX));
                let seconds = base.as_secs_f64() * scale;
                let capped_seconds = if seconds.is_finite() {
                    seconds.min(max.as_secs_f64())
                } else {
                    max.as_secs_f64()
                };

                Duration::from_secs_f64(capped_seconds.max(0.0)) + random_jitter(jitter)
            }
        }
    }
}

fn random_jitter(bound: Duration) -> Duration {
    let bound_ms = u64::try_from(bound.as_millis()).unwrap_or(u64::MAX);
    if bound_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..bound_ms))
}

/// Which failures are retried, how often, and how long to wait.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; a call makes at most
    /// `max_retries + 1` attempts.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Statuses worth another attempt. Every other non-2xx status fails
    /// immediately.
    pub retry_on_status: Vec<u16>,
    pub retry_on_timeout: bool,
    /// Connection resets, refused connections and other transport errors.
    pub retry_on_network: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            retry_on_status: vec![429, 500, 502, 503, 504],
            retry_on_timeout: true,
            retry_on_network: true,
        }
    }
}

impl RetryConfig {
    /// Default exponential schedule with a custom retry budget.
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    /// Single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}
