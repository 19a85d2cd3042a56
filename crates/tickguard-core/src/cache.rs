//! In-memory tiered cache for upstream responses.
//!
//! Entries move through three tiers as they age:
//!
//! | Tier | Age | Read result |
//! |------|-----|-------------|
//! | fresh | `age <= ttl` | [`CacheLookup::Fresh`] |
//! | stale | `ttl < age <= ttl + stale_grace` | [`CacheLookup::Stale`] |
//! | expired | `age > ttl + stale_grace` | deleted, [`CacheLookup::Absent`] |
//!
//! Stale entries are what keeps answers flowing while an upstream is down or
//! out of quota.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::ConfigError;
use crate::fetcher::{Fetched, Origin};
use crate::retry::Backoff;
use crate::{duration_ms, lock_unpoisoned};

/// Which entry is dropped when a new key arrives at a full cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently touched.
    #[default]
    Lru,
    /// Lowest hit count.
    Lfu,
    /// Earliest expiry instant, so overdue entries go before live ones.
    Ttl,
}

impl EvictionPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lru => "lru",
            Self::Lfu => "lfu",
            Self::Ttl => "ttl",
        }
    }
}

impl Display for EvictionPolicy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvictionPolicy {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "ttl" => Ok(Self::Ttl),
            _ => Err(ConfigError::InvalidEvictionPolicy {
                value: value.to_string(),
            }),
        }
    }
}

/// Sizing and freshness settings for a [`TieredCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl: Duration,
    pub stale_grace: Duration,
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            default_ttl: Duration::from_secs(300),
            stale_grace: Duration::from_secs(3_600),
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

/// Result of a cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup<T> {
    Fresh(T),
    Stale(T),
    Absent,
}

impl<T> CacheLookup<T> {
    pub const fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    pub const fn is_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }

    pub const fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    pub fn value(self) -> Option<T> {
        match self {
            Self::Fresh(value) | Self::Stale(value) => Some(value),
            Self::Absent => None,
        }
    }
}

/// Counters exposed for operational visibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_size: usize,
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    /// Entries removed to make room for new keys.
    pub evictions: u64,
    /// Entries removed because they aged past the stale grace window.
    pub expirations: u64,
}

impl CacheStats {
    /// Share of reads answered from cache (fresh or stale), as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.stale_hits;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64 * 100.0
        }
    }
}

/// Age and usage of one entry, without counting as an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub age_ms: u64,
    pub ttl_ms: u64,
    pub idle_ms: u64,
    pub hit_count: u64,
    pub stale: bool,
}

/// Knobs for [`TieredCache::get_with_fallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackOptions {
    /// Overrides the cache default TTL for the written value.
    pub ttl: Option<Duration>,
    pub allow_stale: bool,
    /// Total number of fetch attempts.
    pub max_retries: u32,
    /// Wait before the second attempt; grows linearly after that.
    pub retry_delay: Duration,
}

impl Default for FallbackOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            allow_stale: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Freshness {
    Fresh,
    Stale,
    Expired,
}

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    written_at: Instant,
    ttl: Duration,
    hit_count: u64,
    last_accessed_at: Instant,
    /// Logical access clock; unique per touch so recency never ties.
    last_access_seq: u64,
    insert_seq: u64,
}

impl<T> CacheEntry<T> {
    fn freshness(&self, now: Instant, stale_grace: Duration) -> Freshness {
        let age = now.saturating_duration_since(self.written_at);
        if age <= self.ttl {
            Freshness::Fresh
        } else if age <= self.ttl.saturating_add(stale_grace) {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    /// End of the fresh tier. `None` when the TTL is too long to represent,
    /// which sorts such an entry after every finite expiry.
    fn expires_at(&self) -> Option<Instant> {
        self.written_at.checked_add(self.ttl)
    }
}

#[derive(Debug)]
struct CacheInner<T> {
    entries: HashMap<String, CacheEntry<T>>,
    seq: u64,
    stats: CacheStats,
}

impl<T> CacheInner<T> {
    fn next_seq(&mut self) -> u64 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn victim(&self, policy: EvictionPolicy) -> Option<String> {
        let entries = self.entries.iter();
        let victim = match policy {
            EvictionPolicy::Lru => entries.min_by_key(|(_, entry)| entry.last_access_seq),
            EvictionPolicy::Lfu => {
                entries.min_by_key(|(_, entry)| (entry.hit_count, entry.insert_seq))
            }
            // Earliest expiry instant first, so the most overdue stale entry goes first.
            EvictionPolicy::Ttl => entries.min_by_key(|(_, entry)| {
                let expires_at = entry.expires_at();
                (expires_at.is_none(), expires_at, entry.insert_seq)
            }),
        };
        victim.map(|(key, _)| key.clone())
    }
}

/// Thread-safe key/value cache with fresh, stale and expired tiers.
///
/// Staleness is computed lazily on access; there is no background sweeper.
/// Call [`TieredCache::evict_expired`] to reclaim memory eagerly.
#[derive(Debug)]
pub struct TieredCache<T> {
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner<T>>,
}

impl<T: Clone> Default for TieredCache<T> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<T: Clone> TieredCache<T> {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        let config = CacheConfig {
            max_size: config.max_size.max(1),
            ..config
        };
        Self {
            config,
            clock,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                seq: 0,
                stats: CacheStats {
                    max_size: config.max_size,
                    ..CacheStats::default()
                },
            }),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Reads `key`, deleting it if it aged past the stale grace window.
    ///
    /// A successful read counts as an access for LRU and LFU bookkeeping.
    pub fn get(&self, key: &str) -> CacheLookup<T> {
        let now = self.clock.now();
        let mut guard = lock_unpoisoned(&self.inner);
        let inner = &mut *guard;
        let seq = inner.next_seq();

        let freshness = match inner.entries.get(key) {
            Some(entry) => entry.freshness(now, self.config.stale_grace),
            None => {
                inner.stats.misses += 1;
                tracing::debug!(key, "cache miss");
                return CacheLookup::Absent;
            }
        };

        if freshness == Freshness::Expired {
            inner.entries.remove(key);
            inner.stats.expirations += 1;
            inner.stats.misses += 1;
            inner.stats.entries = inner.entries.len();
            tracing::debug!(key, "cache entry expired past stale grace");
            return CacheLookup::Absent;
        }

        let Some(entry) = inner.entries.get_mut(key) else {
            return CacheLookup::Absent;
        };
        entry.hit_count = entry.hit_count.saturating_add(1);
        entry.last_accessed_at = now;
        entry.last_access_seq = seq;
        let value = entry.value.clone();
        let hits = entry.hit_count;

        if freshness == Freshness::Stale {
            inner.stats.stale_hits += 1;
            tracing::debug!(key, hits, "cache hit (stale)");
            CacheLookup::Stale(value)
        } else {
            inner.stats.hits += 1;
            tracing::debug!(key, hits, "cache hit");
            CacheLookup::Fresh(value)
        }
    }

    /// Writes `value` under `key`.
    ///
    /// Overwriting keeps the hit count and replaces the write timestamp. A new
    /// key arriving at a full cache evicts exactly one entry first.
    pub fn set(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let key = key.into();
        let now = self.clock.now();
        let mut guard = lock_unpoisoned(&self.inner);
        let inner = &mut *guard;
        let seq = inner.next_seq();

        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.value = value;
            entry.written_at = now;
            entry.ttl = ttl;
            entry.last_accessed_at = now;
            entry.last_access_seq = seq;
            return;
        }

        if inner.entries.len() >= self.config.max_size {
            if let Some(victim) = inner.victim(self.config.eviction_policy) {
                inner.entries.remove(&victim);
                inner.stats.evictions += 1;
                tracing::debug!(
                    key = %victim,
                    policy = %self.config.eviction_policy,
                    "cache entry evicted"
                );
            }
        }

        inner.entries.insert(
            key,
            CacheEntry {
                value,
                written_at: now,
                ttl,
                hit_count: 0,
                last_accessed_at: now,
                last_access_seq: seq,
                insert_seq: seq,
            },
        );
        inner.stats.entries = inner.entries.len();
    }

    /// Writes with the configured default TTL.
    pub fn set_default(&self, key: impl Into<String>, value: T) {
        self.set(key, value, self.config.default_ttl);
    }

    /// True when `key` holds a fresh or stale value. Does not count as an access.
    pub fn has(&self, key: &str) -> bool {
        let now = self.clock.now();
        let inner = lock_unpoisoned(&self.inner);
        inner
            .entries
            .get(key)
            .map(|entry| entry.freshness(now, self.config.stale_grace) != Freshness::Expired)
            .unwrap_or(false)
    }

    pub fn delete(&self, key: &str) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        let removed = inner.entries.remove(key).is_some();
        inner.stats.entries = inner.entries.len();
        removed
    }

    /// Drops every entry past its stale grace window and returns how many went.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let mut guard = lock_unpoisoned(&self.inner);
        let inner = &mut *guard;
        let before = inner.entries.len();
        let stale_grace = self.config.stale_grace;
        inner
            .entries
            .retain(|_, entry| entry.freshness(now, stale_grace) != Freshness::Expired);

        let removed = before - inner.entries.len();
        inner.stats.expirations += removed as u64;
        inner.stats.entries = inner.entries.len();
        if removed > 0 {
            tracing::debug!(removed, "expired cache entries removed");
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = lock_unpoisoned(&self.inner);
        inner.entries.clear();
        inner.stats.entries = 0;
        tracing::info!("cache cleared");
    }

    /// Number of stored entries, including ones not yet found expired.
    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        let now = self.clock.now();
        let inner = lock_unpoisoned(&self.inner);
        let entry = inner.entries.get(key)?;
        let freshness = entry.freshness(now, self.config.stale_grace);
        if freshness == Freshness::Expired {
            return None;
        }
        Some(EntryInfo {
            age_ms: duration_ms(now.saturating_duration_since(entry.written_at)),
            ttl_ms: duration_ms(entry.ttl),
            idle_ms: duration_ms(now.saturating_duration_since(entry.last_accessed_at)),
            hit_count: entry.hit_count,
            stale: freshness == Freshness::Stale,
        })
    }

    pub fn keys(&self) -> Vec<String> {
        lock_unpoisoned(&self.inner).entries.keys().cloned().collect()
    }

    pub fn stats(&self) -> CacheStats {
        lock_unpoisoned(&self.inner).stats
    }

    /// Serves `key` from cache when fresh, otherwise calls `fetch`.
    ///
    /// `fetch` runs up to `max_retries` times with linearly growing waits.
    /// Success is written to the cache. When every attempt fails, a stale (or
    /// concurrently refreshed) value is returned if `allow_stale` is set;
    /// otherwise the last error is.
    pub async fn get_with_fallback<F, Fut, E>(
        &self,
        key: &str,
        mut fetch: F,
        options: FallbackOptions,
    ) -> Result<Fetched<T>, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let stale = match self.get(key) {
            CacheLookup::Fresh(value) => return Ok(Fetched::new(value, Origin::Cache, false)),
            CacheLookup::Stale(value) => Some(value),
            CacheLookup::Absent => None,
        };

        let attempts = options.max_retries.max(1);
        let backoff = Backoff::Linear {
            step: options.retry_delay,
        };
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);

        let mut attempt = 0;
        let last_error = loop {
            match fetch().await {
                Ok(value) => {
                    self.set(key, value.clone(), ttl);
                    return Ok(Fetched::new(value, Origin::Network, false));
                }
                Err(error) => {
                    attempt += 1;
                    if attempt >= attempts {
                        break error;
                    }
                    let delay = backoff.delay(attempt - 1);
                    tracing::warn!(
                        key,
                        attempt,
                        error = %error,
                        delay = ?delay,
                        "fetch failed, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
            }
        };

        if options.allow_stale {
            if let Some(fetched) = self.fallback_read(key, stale) {
                tracing::warn!(key, error = %last_error, "serving cached value after failed fetch");
                return Ok(fetched);
            }
        }
        Err(last_error)
    }

    /// Best cached answer after an upstream failure: the current entry if it
    /// is still readable, else the stale value captured before the attempt.
    ///
    /// The initial lookup already counted this call, so the re-read leaves
    /// stats and recency alone.
    pub(crate) fn fallback_read(&self, key: &str, captured: Option<T>) -> Option<Fetched<T>> {
        let now = self.clock.now();
        let current = {
            let inner = lock_unpoisoned(&self.inner);
            inner
                .entries
                .get(key)
                .and_then(|entry| match entry.freshness(now, self.config.stale_grace) {
                    Freshness::Fresh => Some((entry.value.clone(), false)),
                    Freshness::Stale => Some((entry.value.clone(), true)),
                    Freshness::Expired => None,
                })
        };

        match current {
            Some((value, is_stale)) => Some(Fetched::new(value, Origin::Fallback, is_stale)),
            None => captured.map(|value| Fetched::new(value, Origin::Fallback, true)),
        }
    }
}
