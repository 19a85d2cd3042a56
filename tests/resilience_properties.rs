//! Property-based tests for the resilience primitives
//!
//! These tests drive the circuit breaker, token bucket and cache with
//! generated operation sequences and check their invariants at every step.

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tickguard_core::{
    CacheConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState, EvictionPolicy, ManualClock,
    TieredCache, TokenBucket, TokenBucketConfig,
};

#[derive(Debug, Clone)]
enum BucketOp {
    Consume(u32),
    Advance(u64),
}

fn arb_bucket_op() -> impl Strategy<Value = BucketOp> {
    prop_oneof![
        (0_u32..20).prop_map(BucketOp::Consume),
        (0_u64..5_000).prop_map(BucketOp::Advance),
    ]
}

#[derive(Debug, Clone)]
enum CacheOp {
    Set(u8),
    Get(u8),
}

fn arb_cache_op() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (0_u8..12).prop_map(CacheOp::Set),
        (0_u8..12).prop_map(CacheOp::Get),
    ]
}

fn key(id: u8) -> String {
    format!("key-{id}")
}

proptest! {
    /// From CLOSED, the breaker opens exactly when the run of failures since
    /// the last success reaches the threshold.
    #[test]
    fn prop_circuit_opens_after_threshold_consecutive_failures(
        threshold in 1_u32..8,
        outcomes in prop::collection::vec(any::<bool>(), 0..64),
    ) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock(
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(60),
            },
            Arc::new(clock),
        );

        let mut run = 0_u32;
        for succeeded in outcomes {
            prop_assert!(breaker.allow());
            if succeeded {
                breaker.on_success();
                run = 0;
            } else {
                breaker.on_failure();
                run += 1;
            }
            prop_assert_eq!(breaker.consecutive_failures(), run);

            if run >= threshold {
                prop_assert_eq!(breaker.state(), CircuitState::Open);
                prop_assert_eq!(run, threshold);
                break;
            }
            prop_assert_eq!(breaker.state(), CircuitState::Closed);
        }
    }

    /// Available tokens stay within `[0, capacity]` for any interleaving of
    /// consumption and elapsed time.
    #[test]
    fn prop_token_bucket_stays_within_bounds(
        capacity in 1_u32..100,
        refill_tenths in 0_u32..200,
        ops in prop::collection::vec(arb_bucket_op(), 0..100),
    ) {
        let clock = ManualClock::new();
        let capacity = f64::from(capacity);
        let bucket = TokenBucket::with_clock(
            TokenBucketConfig {
                capacity,
                refill_rate_per_second: f64::from(refill_tenths) / 10.0,
            },
            Arc::new(clock.clone()),
        );

        for op in ops {
            match op {
                BucketOp::Consume(n) => {
                    let before = bucket.peek();
                    let admitted = bucket.try_consume(n);
                    prop_assert_eq!(admitted, before >= f64::from(n));
                }
                BucketOp::Advance(ms) => clock.advance(Duration::from_millis(ms)),
            }
            let available = bucket.peek();
            prop_assert!(available >= 0.0, "available {} < 0", available);
            prop_assert!(available <= capacity, "available {} > {}", available, capacity);
        }
    }

    /// A read at offset `delta` from the write is fresh up to the TTL, stale
    /// up to TTL plus grace, and absent afterwards.
    #[test]
    fn prop_cache_freshness_follows_entry_age(
        ttl_ms in 1_u64..10_000,
        grace_ms in 0_u64..10_000,
        delta_ms in 0_u64..25_000,
    ) {
        let clock = ManualClock::new();
        let cache = TieredCache::with_clock(
            CacheConfig {
                max_size: 4,
                default_ttl: Duration::from_millis(ttl_ms),
                stale_grace: Duration::from_millis(grace_ms),
                eviction_policy: EvictionPolicy::Lru,
            },
            Arc::new(clock.clone()),
        );
        cache.set_default("k", 1_u32);
        clock.advance(Duration::from_millis(delta_ms));

        let lookup = cache.get("k");
        if delta_ms <= ttl_ms {
            prop_assert!(lookup.is_fresh());
        } else if delta_ms <= ttl_ms + grace_ms {
            prop_assert!(lookup.is_stale());
        } else {
            prop_assert!(lookup.is_absent());
        }
    }

    /// The cache never grows past `max_size`, and under LRU each eviction
    /// removes the least recently accessed key.
    #[test]
    fn prop_lru_cache_is_bounded_and_evicts_least_recent(
        max_size in 1_usize..6,
        ops in prop::collection::vec(arb_cache_op(), 0..80),
    ) {
        let clock = ManualClock::new();
        let cache = TieredCache::with_clock(
            CacheConfig {
                max_size,
                default_ttl: Duration::from_secs(3_600),
                stale_grace: Duration::from_secs(3_600),
                eviction_policy: EvictionPolicy::Lru,
            },
            Arc::new(clock),
        );
        // Most recently used last.
        let mut recency: Vec<u8> = Vec::new();

        for op in ops {
            match op {
                CacheOp::Set(id) => {
                    if let Some(pos) = recency.iter().position(|k| *k == id) {
                        recency.remove(pos);
                    } else if recency.len() == max_size {
                        let victim = recency.remove(0);
                        cache.set_default(key(id), u32::from(id));
                        prop_assert!(!cache.has(&key(victim)), "expected {} evicted", victim);
                        recency.push(id);
                        prop_assert!(cache.len() <= max_size);
                        continue;
                    }
                    cache.set_default(key(id), u32::from(id));
                    recency.push(id);
                }
                CacheOp::Get(id) => {
                    let hit = cache.get(&key(id)).value();
                    if let Some(pos) = recency.iter().position(|k| *k == id) {
                        prop_assert_eq!(hit, Some(u32::from(id)));
                        let touched = recency.remove(pos);
                        recency.push(touched);
                    } else {
                        prop_assert_eq!(hit, None);
                    }
                }
            }
            prop_assert!(cache.len() <= max_size);
            prop_assert_eq!(cache.len(), recency.len());
        }
    }
}
