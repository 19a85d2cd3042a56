//! Order-preserving fan-out over many keys.

use std::future::Future;

use futures_util::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FetchError;
use crate::fetcher::{FetchOptions, Fetched, ResilientFetcher};
use crate::http_client::HttpRequest;
use crate::provider_policy::ProviderPolicy;

/// Outcome counts for a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Successes that were served from cache after an upstream problem.
    pub from_fallback: usize,
}

impl BatchSummary {
    pub fn from_results<T>(results: &[Result<Fetched<T>, FetchError>]) -> Self {
        let mut summary = Self {
            total: results.len(),
            ..Self::default()
        };
        for result in results {
            match result {
                Ok(fetched) => {
                    summary.succeeded += 1;
                    if fetched.from_fallback() {
                        summary.from_fallback += 1;
                    }
                }
                Err(_) => summary.failed += 1,
            }
        }
        summary
    }
}

/// Runs one fetch per key with bounded concurrency.
///
/// Results come back in input order, one per key. A failing key never stops
/// the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchRunner {
    concurrency: usize,
}

impl Default for BatchRunner {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

impl BatchRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }

    pub fn from_policy(policy: &ProviderPolicy) -> Self {
        Self::with_concurrency(policy.max_concurrency)
    }

    pub const fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run_batch<K, T, F, Fut>(&self, keys: &[K], fetch: F) -> Vec<Result<T, FetchError>>
    where
        F: Fn(&K) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        stream::iter(keys.iter().map(|key| fetch(key)))
            .buffered(self.concurrency)
            .collect()
            .await
    }

    /// Fetches every key through `fetcher`. `build` maps a key to its cache
    /// key and request; a build error becomes that key's result.
    pub async fn fetch_all<K, T, F>(
        &self,
        fetcher: &ResilientFetcher<T>,
        keys: &[K],
        options: FetchOptions,
        build: F,
    ) -> Vec<Result<Fetched<T>, FetchError>>
    where
        T: DeserializeOwned + Clone + Send + Sync,
        F: Fn(&K) -> Result<(String, HttpRequest), FetchError>,
    {
        let results = self
            .run_batch(keys, |key| {
                let built = build(key);
                async move {
                    let (cache_key, request) = built?;
                    fetcher.fetch(&cache_key, request, options).await
                }
            })
            .await;

        let summary = BatchSummary::from_results(&results);
        tracing::info!(
            endpoint = fetcher.name(),
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            from_fallback = summary.from_fallback,
            "batch finished"
        );
        results
    }
}
