//! Resilient fetch orchestration.
//!
//! A [`ResilientFetcher`] owns the breaker, token bucket and cache for one
//! upstream endpoint and runs every request through them in a fixed order:
//!
//! ```text
//! cache (fresh?) ─▶ circuit allow? ─▶ token? ─▶ HTTP attempt loop ─▶ cache write
//!        │                │               │              │
//!        └── return       └── stale / CircuitOpen        └── stale / classified error
//!                                         └── stale / RateLimited
//! ```
//!
//! Refused and failed calls prefer a stale cached value over an error.
//! Invalid requests are the exception: they fail before touching any state.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{CacheLookup, CacheStats, TieredCache};
use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::config::ResilienceConfig;
use crate::duration_ms;
use crate::error::FetchError;
use crate::http_client::{HttpClient, HttpRequest};
use crate::retry::RetryConfig;
use crate::token_bucket::{RateLimitStatus, TokenBucket};

/// Where a successful answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Fresh cache hit; no upstream call.
    Cache,
    /// Upstream answered on this call.
    Network,
    /// Cached value served because the upstream call was refused or failed.
    Fallback,
}

/// Value returned by a resilient fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub origin: Origin,
    /// The value is past its TTL but inside the stale grace window.
    pub is_stale: bool,
}

impl<T> Fetched<T> {
    pub(crate) fn new(value: T, origin: Origin, is_stale: bool) -> Self {
        Self {
            value,
            origin,
            is_stale,
        }
    }

    pub fn from_fallback(&self) -> bool {
        self.origin == Origin::Fallback
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Per-call overrides of the fetcher defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub ttl: Option<Duration>,
    pub max_retries: Option<u32>,
    pub allow_stale: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            max_retries: None,
            allow_stale: true,
        }
    }
}

impl FetchOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Fail instead of serving stale data when the upstream is unavailable.
    pub fn without_stale(mut self) -> Self {
        self.allow_stale = false;
        self
    }
}

/// Coarse health derived from the breaker and bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub state: HealthState,
    pub rate_available: bool,
}

/// Combined status report for one endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetcherStatus {
    pub name: String,
    pub circuit: CircuitSnapshot,
    pub rate_limit: RateLimitStatus,
    pub cache: CacheStats,
    pub health: HealthStatus,
}

/// Circuit breaker + token bucket + tiered cache in front of one upstream.
///
/// Share it between concurrent callers through an `Arc`; every piece of
/// mutable state sits behind its own lock and no lock is held across an
/// await point.
pub struct ResilientFetcher<T> {
    name: String,
    http: Arc<dyn HttpClient>,
    clock: Arc<dyn Clock>,
    breaker: CircuitBreaker,
    bucket: TokenBucket,
    cache: TieredCache<T>,
    retry: RetryConfig,
    request_timeout: Duration,
}

impl<T> std::fmt::Debug for ResilientFetcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientFetcher")
            .field("name", &self.name)
            .field("circuit", &self.breaker.state())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl<T> ResilientFetcher<T>
where
    T: DeserializeOwned + Clone + Send + Sync,
{
    pub fn new(
        name: impl Into<String>,
        http: Arc<dyn HttpClient>,
        config: &ResilienceConfig,
    ) -> Self {
        Self::with_clock(name, http, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        http: Arc<dyn HttpClient>,
        config: &ResilienceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            http,
            breaker: CircuitBreaker::with_clock(config.circuit_breaker(), Arc::clone(&clock)),
            bucket: TokenBucket::with_clock(config.token_bucket(), Arc::clone(&clock)),
            cache: TieredCache::with_clock(config.cache(), Arc::clone(&clock)),
            retry: config.retry(),
            request_timeout: config.request_timeout(),
            clock,
        }
    }

    /// Replaces the retry policy, e.g. to drop jitter in tests.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn fetch_default(
        &self,
        key: &str,
        request: HttpRequest,
    ) -> Result<Fetched<T>, FetchError> {
        self.fetch(key, request, FetchOptions::default()).await
    }

    /// Returns the value for `key`, going upstream with `request` only when
    /// the cache has nothing fresh.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidRequest`] for a malformed request, before any
    ///   state is touched.
    /// - [`FetchError::CircuitOpen`] / [`FetchError::RateLimited`] when the
    ///   call is refused locally and nothing is cached.
    /// - The classified upstream error once attempts are exhausted and no
    ///   cached value exists (or `allow_stale` is off).
    pub async fn fetch(
        &self,
        key: &str,
        request: HttpRequest,
        options: FetchOptions,
    ) -> Result<Fetched<T>, FetchError> {
        if let Err(error) = request.validate() {
            tracing::error!(
                endpoint = %self.name,
                key,
                error = %error,
                "rejecting invalid request"
            );
            return Err(error);
        }

        let stale = match self.cache.get(key) {
            CacheLookup::Fresh(value) => return Ok(Fetched::new(value, Origin::Cache, false)),
            CacheLookup::Stale(value) => Some(value),
            CacheLookup::Absent => None,
        };

        if !self.breaker.allow() {
            let error = FetchError::CircuitOpen {
                endpoint: self.name.clone(),
            };
            return self.refuse(key, stale, options, error);
        }

        if !self.bucket.try_consume(1) {
            let error = FetchError::RateLimited {
                endpoint: self.name.clone(),
            };
            return self.refuse(key, stale, options, error);
        }

        let max_retries = options.max_retries.unwrap_or(self.retry.max_retries);
        match self.attempt_loop(key, &request, max_retries).await {
            Ok(value) => {
                let ttl = options.ttl.unwrap_or(self.cache.config().default_ttl);
                self.cache.set(key, value.clone(), ttl);
                Ok(Fetched::new(value, Origin::Network, false))
            }
            Err(error) if error.is_invalid_request() => Err(error),
            Err(error) => {
                if options.allow_stale {
                    if let Some(fetched) = self.cache.fallback_read(key, stale) {
                        tracing::warn!(
                            endpoint = %self.name,
                            key,
                            error = %error,
                            stale = fetched.is_stale,
                            "upstream failed, serving cached value"
                        );
                        return Ok(fetched);
                    }
                }
                Err(error)
            }
        }
    }

    fn refuse(
        &self,
        key: &str,
        stale: Option<T>,
        options: FetchOptions,
        error: FetchError,
    ) -> Result<Fetched<T>, FetchError> {
        match stale {
            Some(value) if options.allow_stale => {
                tracing::debug!(
                    endpoint = %self.name,
                    key,
                    reason = error.code(),
                    "serving stale value"
                );
                Ok(Fetched::new(value, Origin::Fallback, true))
            }
            _ => {
                tracing::debug!(
                    endpoint = %self.name,
                    key,
                    reason = error.code(),
                    "request refused locally"
                );
                Err(error)
            }
        }
    }

    async fn attempt_loop(
        &self,
        key: &str,
        request: &HttpRequest,
        max_retries: u32,
    ) -> Result<T, FetchError> {
        let mut attempt = 0_u32;
        loop {
            tracing::debug!(endpoint = %self.name, key, attempt, "upstream attempt");
            let error = match self.attempt(request.clone()).await {
                Ok(value) => {
                    self.breaker.on_success();
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.is_invalid_request() {
                return Err(error);
            }
            if !self.should_retry(&error) {
                self.breaker.on_failure();
                tracing::warn!(
                    endpoint = %self.name,
                    key,
                    error = %error,
                    "non-retryable upstream failure"
                );
                return Err(error);
            }
            if attempt >= max_retries {
                self.breaker.on_failure();
                tracing::warn!(
                    endpoint = %self.name,
                    key,
                    attempts = attempt + 1,
                    error = %error,
                    "retries exhausted"
                );
                return Err(error);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            tracing::warn!(
                endpoint = %self.name,
                key,
                attempt,
                delay_ms = duration_ms(delay),
                error = %error,
                "retrying upstream request"
            );
            self.clock.sleep(delay).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, request: HttpRequest) -> Result<T, FetchError> {
        let limit = request.timeout().min(self.request_timeout);
        let response = match tokio::time::timeout(limit, self.http.execute(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => return Err(FetchError::from_transport(&error)),
            Err(_) => {
                return Err(FetchError::Timeout(format!(
                    "no response within {}ms",
                    duration_ms(limit)
                )))
            }
        };

        if !response.is_success() {
            return Err(FetchError::Status {
                status: response.status,
                retryable: self.retry.should_retry_status(response.status),
            });
        }

        serde_json::from_str(&response.body)
            .map_err(|error| FetchError::MalformedResponse(error.to_string()))
    }

    fn should_retry(&self, error: &FetchError) -> bool {
        match error {
            FetchError::Timeout(_) => self.retry.retry_on_timeout,
            FetchError::Network(_) => self.retry.retry_on_network,
            FetchError::Status { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn circuit_snapshot(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    pub fn rate_limit_status(&self) -> RateLimitStatus {
        self.bucket.status()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Direct access to the cache, e.g. to pre-warm or invalidate keys.
    pub fn cache(&self) -> &TieredCache<T> {
        &self.cache
    }

    pub fn reset_circuit(&self) {
        self.breaker.reset();
        tracing::info!(endpoint = %self.name, "circuit reset");
    }

    pub fn reset_rate_limiter(&self) {
        self.bucket.reset();
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    pub fn health(&self) -> HealthStatus {
        let state = match self.breaker.state() {
            CircuitState::Closed => HealthState::Healthy,
            CircuitState::HalfOpen => HealthState::Degraded,
            CircuitState::Open => HealthState::Unhealthy,
        };
        HealthStatus {
            state,
            rate_available: self.bucket.status().has_capacity(),
        }
    }

    pub fn status(&self) -> FetcherStatus {
        FetcherStatus {
            name: self.name.clone(),
            circuit: self.circuit_snapshot(),
            rate_limit: self.rate_limit_status(),
            cache: self.cache_stats(),
            health: self.health(),
        }
    }
}
