//! Resilience settings for one upstream endpoint.
//!
//! Values come from code, a JSON document, or environment variables layered
//! over the defaults:
//!
//! | Variable (`<PREFIX>_…`) | Field | Default |
//! |-------------------------|-------|---------|
//! | `FAILURE_THRESHOLD` | `failure_threshold` | 5 |
//! | `RESET_TIMEOUT_MS` | `reset_timeout_ms` | 60000 |
//! | `CAPACITY` | `capacity` | 60 |
//! | `REFILL_RATE_PER_SECOND` | `refill_rate_per_second` | 1.0 |
//! | `MAX_SIZE` | `max_size` | 1000 |
//! | `DEFAULT_TTL_MS` | `default_ttl_ms` | 300000 |
//! | `STALE_GRACE_MS` | `stale_grace_ms` | 3600000 |
//! | `EVICTION_POLICY` | `eviction_policy` | `lru` |
//! | `MAX_RETRIES` | `max_retries` | 3 |
//! | `BASE_DELAY_MS` | `base_delay_ms` | 1000 |
//! | `MAX_DELAY_MS` | `max_delay_ms` | 30000 |
//! | `JITTER_MS` | `jitter_ms` | 1000 |
//! | `REQUEST_TIMEOUT_MS` | `request_timeout_ms` | 10000 |

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{CacheConfig, EvictionPolicy};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::ConfigError;
use crate::retry::{Backoff, RetryConfig};
use crate::token_bucket::TokenBucketConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub capacity: f64,
    pub refill_rate_per_second: f64,
    pub max_size: usize,
    pub default_ttl_ms: u64,
    pub stale_grace_ms: u64,
    pub eviction_policy: EvictionPolicy,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            capacity: 60.0,
            refill_rate_per_second: 1.0,
            max_size: 1_000,
            default_ttl_ms: 300_000,
            stale_grace_ms: 3_600_000,
            eviction_policy: EvictionPolicy::Lru,
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 1_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl ResilienceConfig {
    /// Parses a JSON document; missing fields keep their defaults.
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `<prefix>_*` environment variables.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::default().with_overrides(prefix, |name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn with_overrides<F>(mut self, prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| format!("{prefix}_{suffix}");

        override_from(&lookup, &var("FAILURE_THRESHOLD"), &mut self.failure_threshold)?;
        override_from(&lookup, &var("RESET_TIMEOUT_MS"), &mut self.reset_timeout_ms)?;
        override_from(&lookup, &var("CAPACITY"), &mut self.capacity)?;
        override_from(&lookup, &var("REFILL_RATE_PER_SECOND"), &mut self.refill_rate_per_second)?;
        override_from(&lookup, &var("MAX_SIZE"), &mut self.max_size)?;
        override_from(&lookup, &var("DEFAULT_TTL_MS"), &mut self.default_ttl_ms)?;
        override_from(&lookup, &var("STALE_GRACE_MS"), &mut self.stale_grace_ms)?;
        override_from(&lookup, &var("EVICTION_POLICY"), &mut self.eviction_policy)?;
        override_from(&lookup, &var("MAX_RETRIES"), &mut self.max_retries)?;
        override_from(&lookup, &var("BASE_DELAY_MS"), &mut self.base_delay_ms)?;
        override_from(&lookup, &var("MAX_DELAY_MS"), &mut self.max_delay_ms)?;
        override_from(&lookup, &var("JITTER_MS"), &mut self.jitter_ms)?;
        override_from(&lookup, &var("REQUEST_TIMEOUT_MS"), &mut self.request_timeout_ms)?;

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::NotPositive {
                field: "failure_threshold",
            });
        }
        if !(self.capacity.is_finite() && self.capacity > 0.0) {
            return Err(ConfigError::NotPositive { field: "capacity" });
        }
        if !(self.refill_rate_per_second.is_finite() && self.refill_rate_per_second > 0.0) {
            return Err(ConfigError::NotPositive {
                field: "refill_rate_per_second",
            });
        }
        if self.max_size == 0 {
            return Err(ConfigError::NotPositive { field: "max_size" });
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::NotPositive {
                field: "request_timeout_ms",
            });
        }
        Ok(())
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_millis(self.reset_timeout_ms),
        }
    }

    pub fn token_bucket(&self) -> TokenBucketConfig {
        TokenBucketConfig {
            capacity: self.capacity,
            refill_rate_per_second: self.refill_rate_per_second,
        }
    }

    pub fn cache(&self) -> CacheConfig {
        CacheConfig {
            max_size: self.max_size,
            default_ttl: Duration::from_millis(self.default_ttl_ms),
            stale_grace: Duration::from_millis(self.stale_grace_ms),
            eviction_policy: self.eviction_policy,
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(self.base_delay_ms),
                factor: 2.0,
                max: Duration::from_millis(self.max_delay_ms),
                jitter: Duration::from_millis(self.jitter_ms),
            },
            ..RetryConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn override_from<F, V>(lookup: &F, name: &str, slot: &mut V) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    V: FromStr,
{
    let Some(raw) = lookup(name) else {
        return Ok(());
    };
    *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: raw.clone(),
    })?;
    Ok(())
}
