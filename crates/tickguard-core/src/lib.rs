//! # Tickguard Core
//!
//! Resilience layer for quota-limited upstream APIs (market data, news,
//! polling, social and event feeds).
//!
//! ## Overview
//!
//! Every outbound endpoint gets its own [`ResilientFetcher`], which combines:
//!
//! - **Circuit breaker** that stops calling an upstream after repeated failures
//! - **Token bucket** that keeps request volume inside the provider quota
//! - **Tiered cache** that serves fresh values, and stale ones while the
//!   upstream is unavailable
//! - **Retry with backoff** for transient failures
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`batch`] | Order-preserving fan-out with bounded concurrency |
//! | [`cache`] | Tiered cache with LRU/LFU/TTL eviction |
//! | [`circuit_breaker`] | Three-state circuit breaker |
//! | [`clock`] | Injectable time source |
//! | [`config`] | Resilience settings from code, JSON or environment |
//! | [`endpoint`] | Query-string endpoint adapters |
//! | [`error`] | Fetch and configuration errors |
//! | [`fetcher`] | Resilient fetch orchestration |
//! | [`http_client`] | HTTP client abstraction |
//! | [`provider_policy`] | Per-integration quota presets |
//! | [`retry`] | Backoff strategies and retry rules |
//! | [`token_bucket`] | Continuous-refill rate limiter |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tickguard_core::{HttpRequest, ReqwestHttpClient, ResilienceConfig, ResilientFetcher};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let fetcher = ResilientFetcher::<serde_json::Value>::new(
//!         "polls",
//!         Arc::new(ReqwestHttpClient::new()),
//!         &ResilienceConfig::from_env("TICKGUARD_POLLING")?,
//!     );
//!
//!     let request = HttpRequest::get("https://polls.example.com/api/latest");
//!     let fetched = fetcher.fetch_default("latest", request).await?;
//!     println!("{:?} (stale: {})", fetched.origin, fetched.is_stale);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌──────────────────┐
//! │ EndpointClient  │────▶│   BatchRunner    │
//! └────────┬────────┘     └────────┬─────────┘
//!          │                       │
//!          ▼                       ▼
//! ┌─────────────────────────────────────────┐
//! │            ResilientFetcher             │
//! │  TieredCache · CircuitBreaker · Bucket  │
//! └────────────────────┬────────────────────┘
//!                      │
//!                      ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ HttpClient      │────▶│ reqwest / script │
//! └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Security
//!
//! - Credentials never appear in logs, cache keys or `Debug` output
//! - Log events name the endpoint and cache key, not the request URL

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fetcher;
pub mod http_client;
pub mod provider_policy;
pub mod retry;
pub mod token_bucket;

// Batching
pub use batch::{BatchRunner, BatchSummary};

// Caching
pub use cache::{
    CacheConfig, CacheLookup, CacheStats, EntryInfo, EvictionPolicy, FallbackOptions, TieredCache,
};

// Circuit breaker
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, CircuitState};

// Time
pub use clock::{Clock, ManualClock, SystemClock};

// Configuration
pub use config::ResilienceConfig;
pub use provider_policy::{IntegrationKind, ProviderPolicy};

// Endpoint adapters
pub use endpoint::{EndpointClient, QueryEndpoint};

// Error types
pub use error::{ConfigError, FetchError};

// Fetching
pub use fetcher::{
    FetchOptions, Fetched, FetcherStatus, HealthState, HealthStatus, Origin, ResilientFetcher,
};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpErrorKind, HttpRequest, HttpResponse, ReqwestHttpClient,
    ScriptedHttpClient,
};

// Retry logic
pub use retry::{Backoff, RetryConfig};

// Rate limiting
pub use token_bucket::{RateLimitStatus, TokenBucket, TokenBucketConfig};

/// Locks `mutex`, recovering the data if a holder panicked. All guarded
/// state is left consistent between statements, so a poisoned lock is safe
/// to reuse.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
