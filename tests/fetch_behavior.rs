//! Behavior-driven tests for the resilient fetch path
//!
//! These tests verify HOW a fetcher reacts to upstream failures: when it
//! retries, when it trips the circuit, and when it answers from cache instead.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tickguard_core::{
    Backoff, CircuitState, FetchError, FetchOptions, HttpError, HttpRequest, HttpResponse,
    ManualClock, Origin, ResilienceConfig, ResilientFetcher, RetryConfig, ScriptedHttpClient,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
struct Headline {
    id: u32,
    title: String,
}

const HEADLINE: &str = r#"{"id":7,"title":"Fed holds rates"}"#;

fn no_jitter(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        backoff: Backoff::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: Duration::ZERO,
        },
        ..RetryConfig::default()
    }
}

fn fetcher_with(
    client: &Arc<ScriptedHttpClient>,
    config: ResilienceConfig,
) -> (ResilientFetcher<Headline>, ManualClock) {
    let clock = ManualClock::new();
    let retry = no_jitter(config.max_retries);
    let fetcher = ResilientFetcher::with_clock(
        "news.headlines",
        Arc::clone(client) as Arc<dyn tickguard_core::HttpClient>,
        &config,
        Arc::new(clock.clone()),
    )
    .with_retry(retry);
    (fetcher, clock)
}

fn request(id: &str) -> HttpRequest {
    HttpRequest::get(format!("https://news.example.test/headlines/{id}"))
}

// =============================================================================
// Circuit Breaker Integration
// =============================================================================

#[tokio::test]
async fn when_upstream_times_out_repeatedly_circuit_opens_and_blocks_calls() {
    // Given: A fetcher that trips after three failures and never retries
    let client = Arc::new(
        ScriptedHttpClient::new().always(Err(HttpError::timeout("upstream took too long"))),
    );
    let config = ResilienceConfig {
        failure_threshold: 3,
        max_retries: 0,
        ..ResilienceConfig::default()
    };
    let (fetcher, _clock) = fetcher_with(&client, config);

    // When: Three fetches of the same key time out
    for _ in 0..3 {
        let error = fetcher
            .fetch_default("m1", request("m1"))
            .await
            .expect_err("timeout should surface");
        assert!(matches!(error, FetchError::Timeout(_)));
    }

    // Then: The circuit is open
    assert_eq!(fetcher.circuit_state(), CircuitState::Open);
    assert_eq!(fetcher.circuit_state().to_string(), "OPEN");

    // And: The next call is refused without touching the network
    let error = fetcher
        .fetch_default("m1", request("m1"))
        .await
        .expect_err("circuit should be open");
    assert!(matches!(error, FetchError::CircuitOpen { .. }));
    assert!(error.is_local_rejection());
    assert_eq!(client.calls(), 3);
}

#[tokio::test]
async fn when_reset_timeout_elapses_a_successful_probe_closes_the_circuit() {
    // Given: An open circuit with a 60s reset timeout
    let client = Arc::new(
        ScriptedHttpClient::new()
            .respond(503, "")
            .respond(200, HEADLINE),
    );
    let config = ResilienceConfig {
        failure_threshold: 1,
        max_retries: 0,
        ..ResilienceConfig::default()
    };
    let (fetcher, clock) = fetcher_with(&client, config);
    let _ = fetcher.fetch_default("latest", request("latest")).await;
    assert_eq!(fetcher.circuit_state(), CircuitState::Open);

    // When: The reset timeout passes and the upstream has recovered
    clock.advance(Duration::from_secs(60));
    let fetched = fetcher
        .fetch_default("latest", request("latest"))
        .await
        .expect("probe should succeed");

    // Then: The probe's answer is returned and the circuit is closed again
    assert_eq!(fetched.origin, Origin::Network);
    assert_eq!(fetched.value.title, "Fed holds rates");
    assert_eq!(fetcher.circuit_state(), CircuitState::Closed);
    assert_eq!(fetcher.circuit_snapshot().consecutive_failures, 0);
}

#[tokio::test]
async fn when_half_open_probe_fails_circuit_reopens() {
    // Given: An open circuit past its reset timeout
    let client = Arc::new(ScriptedHttpClient::new().always(Ok(HttpResponse::new(502, ""))));
    let config = ResilienceConfig {
        failure_threshold: 1,
        max_retries: 0,
        ..ResilienceConfig::default()
    };
    let (fetcher, clock) = fetcher_with(&client, config);
    let _ = fetcher.fetch_default("latest", request("latest")).await;
    clock.advance(Duration::from_secs(61));

    // When: The probe fails
    let error = fetcher
        .fetch_default("latest", request("latest"))
        .await
        .expect_err("probe fails");

    // Then: The circuit is open again and the failure was a real upstream call
    assert_eq!(error.status(), Some(502));
    assert_eq!(fetcher.circuit_state(), CircuitState::Open);
    assert_eq!(client.calls(), 2);
}

// =============================================================================
// Error Classification
// =============================================================================

#[tokio::test]
async fn when_upstream_returns_404_fetch_fails_once_without_retry() {
    // Given: A fetcher with the default retry budget
    let client = Arc::new(ScriptedHttpClient::new().respond(404, "not found"));
    let (fetcher, clock) = fetcher_with(&client, ResilienceConfig::default());
    let before = fetcher.circuit_snapshot().consecutive_failures;

    // When: The upstream answers 404
    let error = fetcher
        .fetch_default("missing", request("missing"))
        .await
        .expect_err("404 is terminal");

    // Then: Exactly one attempt was made and one failure was recorded
    assert_eq!(error.status(), Some(404));
    assert!(!error.retryable());
    assert_eq!(client.calls(), 1);
    assert!(clock.sleeps().is_empty());
    assert_eq!(fetcher.circuit_snapshot().consecutive_failures, before + 1);
}

#[tokio::test]
async fn when_upstream_returns_429_fetch_retries_with_backoff() {
    // Given: An upstream that throttles twice before answering
    let client = Arc::new(
        ScriptedHttpClient::new()
            .respond(429, "slow down")
            .respond(429, "slow down")
            .respond(200, HEADLINE),
    );
    let (fetcher, clock) = fetcher_with(&client, ResilienceConfig::default());

    // When: The system fetches
    let fetched = fetcher
        .fetch_default("latest", request("latest"))
        .await
        .expect("third attempt succeeds");

    // Then: Backoff doubled between attempts and the value is fresh
    assert_eq!(fetched.origin, Origin::Network);
    assert!(!fetched.is_stale);
    assert_eq!(
        clock.sleeps(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
}

#[tokio::test]
async fn when_request_is_malformed_nothing_is_consumed() {
    // Given: A fetcher with a full bucket
    let client = Arc::new(ScriptedHttpClient::new());
    let (fetcher, _clock) = fetcher_with(&client, ResilienceConfig::default());

    // When: The request URL uses an unsupported scheme
    let error = fetcher
        .fetch_default("bad", HttpRequest::get("ftp://news.example.test/latest"))
        .await
        .expect_err("invalid request");

    // Then: The error is reported as-is and no state changed
    assert_eq!(error.code(), "fetch.invalid_request");
    assert_eq!(client.calls(), 0);
    assert_eq!(fetcher.rate_limit_status().available, 60.0);
    assert_eq!(fetcher.circuit_snapshot().consecutive_failures, 0);
}

// =============================================================================
// Stale Fallback
// =============================================================================

#[tokio::test]
async fn when_retries_are_exhausted_stale_value_is_served_instead_of_error() {
    // Given: A cached headline that has gone stale
    let client = Arc::new(
        ScriptedHttpClient::new()
            .respond(200, HEADLINE)
            .fail(HttpError::connect("connection refused"))
            .fail(HttpError::connect("connection refused"))
            .fail(HttpError::connect("connection refused")),
    );
    let config = ResilienceConfig {
        max_retries: 2,
        ..ResilienceConfig::default()
    };
    let (fetcher, clock) = fetcher_with(&client, config);
    fetcher
        .fetch_default("latest", request("latest"))
        .await
        .expect("initial fill");
    clock.advance(Duration::from_secs(10 * 60));

    // When: Every refresh attempt fails with a retryable error
    let fetched = fetcher
        .fetch_default("latest", request("latest"))
        .await
        .expect("stale value instead of error");

    // Then: The stale value comes back, marked as such
    assert_eq!(fetched.origin, Origin::Fallback);
    assert!(fetched.is_stale);
    assert_eq!(fetched.value.id, 7);
    assert_eq!(client.calls(), 4);
}

#[tokio::test]
async fn when_stale_is_disallowed_the_upstream_error_is_returned() {
    // Given: A stale cached headline and a failing upstream
    let client = Arc::new(
        ScriptedHttpClient::new()
            .respond(200, HEADLINE)
            .always(Err(HttpError::connect("connection refused"))),
    );
    let config = ResilienceConfig {
        max_retries: 0,
        ..ResilienceConfig::default()
    };
    let (fetcher, clock) = fetcher_with(&client, config);
    fetcher
        .fetch_default("latest", request("latest"))
        .await
        .expect("initial fill");
    clock.advance(Duration::from_secs(10 * 60));

    // When: The caller opts out of stale answers
    let error = fetcher
        .fetch("latest", request("latest"), FetchOptions::default().without_stale())
        .await
        .expect_err("no stale fallback");

    // Then: The classified network error surfaces
    assert_eq!(error.code(), "fetch.network");
}

#[tokio::test]
async fn when_circuit_is_open_stale_value_is_served_without_network() {
    // Given: A stale entry and an open circuit
    let client = Arc::new(
        ScriptedHttpClient::new()
            .respond(200, HEADLINE)
            .always(Ok(HttpResponse::new(500, ""))),
    );
    let config = ResilienceConfig {
        failure_threshold: 1,
        max_retries: 0,
        ..ResilienceConfig::default()
    };
    let (fetcher, clock) = fetcher_with(&client, config);
    fetcher
        .fetch_default("latest", request("latest"))
        .await
        .expect("initial fill");
    clock.advance(Duration::from_secs(10 * 60));
    let _ = fetcher.fetch_default("other", request("other")).await;
    assert_eq!(fetcher.circuit_state(), CircuitState::Open);
    let calls_before = client.calls();

    // When: The stale key is requested
    let fetched = fetcher
        .fetch_default("latest", request("latest"))
        .await
        .expect("stale fallback");

    // Then: It is answered from cache without a network attempt
    assert_eq!(fetched.origin, Origin::Fallback);
    assert!(fetched.is_stale);
    assert_eq!(client.calls(), calls_before);
}

// =============================================================================
// Rate Limiting
// =============================================================================

#[tokio::test]
async fn when_bucket_is_empty_stale_value_is_served_and_refill_readmits() {
    // Given: A bucket of two tokens refilling one per second
    let client = Arc::new(ScriptedHttpClient::new().always(Ok(HttpResponse::ok_json(HEADLINE))));
    let config = ResilienceConfig {
        capacity: 2.0,
        refill_rate_per_second: 1.0,
        default_ttl_ms: 1_000,
        ..ResilienceConfig::default()
    };
    let (fetcher, clock) = fetcher_with(&client, config);
    fetcher.fetch_default("a", request("a")).await.expect("first token");
    fetcher.fetch_default("b", request("b")).await.expect("second token");

    // When: "a" goes stale while the bucket is empty
    clock.advance(Duration::from_millis(1_500));
    fetcher.fetch_default("c", request("c")).await.expect("refilled token");
    let fetched = fetcher
        .fetch_default("a", request("a"))
        .await
        .expect("stale fallback");

    // Then: The stale value is served without a network call
    assert_eq!(fetched.origin, Origin::Fallback);
    assert_eq!(client.calls(), 3);

    // And: Once a token refills, the key is fetched from the network again
    clock.advance(Duration::from_secs(1));
    let fetched = fetcher
        .fetch_default("a", request("a"))
        .await
        .expect("network again");
    assert_eq!(fetched.origin, Origin::Network);
    assert_eq!(client.calls(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_fetches_never_overspend_the_bucket() {
    // Given: One shared fetcher with five tokens and a clock that never refills
    let client = Arc::new(ScriptedHttpClient::new().always(Ok(HttpResponse::ok_json(HEADLINE))));
    let config = ResilienceConfig {
        capacity: 5.0,
        refill_rate_per_second: 1.0,
        ..ResilienceConfig::default()
    };
    let (fetcher, _clock) = fetcher_with(&client, config);
    let fetcher = Arc::new(fetcher);

    // When: Twenty tasks fetch distinct keys at once
    let handles: Vec<_> = (0..20)
        .map(|id| {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move {
                let key = format!("story-{id}");
                fetcher.fetch_default(&key, request(&key)).await
            })
        })
        .collect();

    let mut admitted = 0;
    let mut rate_limited = 0;
    for handle in handles {
        match handle.await.expect("fetch task completes") {
            Ok(fetched) => {
                assert_eq!(fetched.origin, Origin::Network);
                admitted += 1;
            }
            Err(FetchError::RateLimited { .. }) => rate_limited += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    // Then: Exactly the bucket's capacity reached the upstream
    assert_eq!(admitted, 5);
    assert_eq!(rate_limited, 15);
    assert_eq!(client.calls(), 5);
    assert!(fetcher.rate_limit_status().available < 1.0);
}

#[tokio::test]
async fn fetcher_status_reports_every_component() {
    // Given: A fetcher that served one network and one cached answer
    let client = Arc::new(ScriptedHttpClient::new().respond(200, HEADLINE));
    let (fetcher, _clock) = fetcher_with(&client, ResilienceConfig::default());
    fetcher.fetch_default("latest", request("latest")).await.expect("network");
    fetcher.fetch_default("latest", request("latest")).await.expect("cache");

    // When: Status is collected
    let status = fetcher.status();
    let json = serde_json::to_value(&status).expect("status serializes");

    // Then: Each component is represented
    assert_eq!(status.cache.hits, 1);
    assert_eq!(status.cache.entries, 1);
    assert_eq!(status.rate_limit.available, 59.0);
    assert_eq!(json["circuit"]["state"], "CLOSED");
    assert_eq!(json["health"]["state"], "healthy");
}
