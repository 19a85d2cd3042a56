//! Thin per-API adapters.
//!
//! An integration client only knows how to build its URLs; everything about
//! retries, quotas and caching lives in the shared [`ResilientFetcher`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tickguard_core::{
//!     EndpointClient, HttpAuth, ProviderPolicy, QueryEndpoint, ReqwestHttpClient,
//!     ResilientFetcher,
//! };
//!
//! let policy = ProviderPolicy::market_data_default();
//! let fetcher = Arc::new(ResilientFetcher::<serde_json::Value>::new(
//!     "alphavantage.quote",
//!     Arc::new(ReqwestHttpClient::new()),
//!     &policy.to_config(),
//! ));
//! let endpoint = QueryEndpoint::new("alphavantage.quote", "https://www.alphavantage.co/query")
//!     .with_param("function", "GLOBAL_QUOTE")
//!     .with_auth(HttpAuth::QueryParam { name: "apikey".into(), value: api_key });
//!
//! let client = EndpointClient::new(endpoint, fetcher);
//! let quote = client.get(&[("symbol", "AAPL")]).await?;
//! ```

use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::batch::BatchRunner;
use crate::error::FetchError;
use crate::fetcher::{FetchOptions, Fetched, ResilientFetcher};
use crate::http_client::{HttpAuth, HttpRequest};

/// GET endpoint addressed by query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEndpoint {
    name: String,
    base_url: String,
    fixed_params: Vec<(String, String)>,
    auth: HttpAuth,
    timeout_ms: u64,
}

impl QueryEndpoint {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            fixed_params: Vec::new(),
            auth: HttpAuth::None,
            timeout_ms: 10_000,
        }
    }

    /// Adds a parameter sent on every request.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fixed_params.push((name.into(), value.into()));
        self
    }

    pub fn with_auth(mut self, auth: HttpAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable cache key: endpoint name plus sorted parameters. Credentials
    /// are never part of the key.
    pub fn cache_key(&self, params: &[(&str, &str)]) -> String {
        let mut pairs: Vec<(&str, &str)> = self
            .fixed_params
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .chain(params.iter().copied())
            .collect();
        pairs.sort_unstable();

        if pairs.is_empty() {
            return self.name.clone();
        }
        format!("{}?{}", self.name, encode_pairs(pairs))
    }

    pub fn url(&self, params: &[(&str, &str)]) -> String {
        let pairs = self
            .fixed_params
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .chain(params.iter().copied())
            .chain(self.auth.query_param());
        let query = encode_pairs(pairs);

        if query.is_empty() {
            self.base_url.clone()
        } else if self.base_url.contains('?') {
            format!("{}&{}", self.base_url, query)
        } else {
            format!("{}?{}", self.base_url, query)
        }
    }

    pub fn build(&self, params: &[(&str, &str)]) -> Result<HttpRequest, FetchError> {
        let request = HttpRequest::get(self.url(params))
            .with_auth(&self.auth)
            .with_header("accept", "application/json")
            .with_timeout_ms(self.timeout_ms);
        request.validate()?;
        Ok(request)
    }
}

fn encode_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .map(|(name, value)| {
            format!(
                "{}={}",
                urlencoding::encode(name),
                urlencoding::encode(value)
            )
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// A [`QueryEndpoint`] bound to the fetcher guarding its provider.
#[derive(Debug)]
pub struct EndpointClient<T> {
    endpoint: QueryEndpoint,
    fetcher: Arc<ResilientFetcher<T>>,
    runner: BatchRunner,
}

impl<T> EndpointClient<T>
where
    T: DeserializeOwned + Clone + Send + Sync,
{
    pub fn new(endpoint: QueryEndpoint, fetcher: Arc<ResilientFetcher<T>>) -> Self {
        Self {
            endpoint,
            fetcher,
            runner: BatchRunner::default(),
        }
    }

    pub fn with_runner(mut self, runner: BatchRunner) -> Self {
        self.runner = runner;
        self
    }

    pub fn endpoint(&self) -> &QueryEndpoint {
        &self.endpoint
    }

    pub fn fetcher(&self) -> &Arc<ResilientFetcher<T>> {
        &self.fetcher
    }

    pub async fn get(&self, params: &[(&str, &str)]) -> Result<Fetched<T>, FetchError> {
        self.get_with(params, FetchOptions::default()).await
    }

    pub async fn get_with(
        &self,
        params: &[(&str, &str)],
        options: FetchOptions,
    ) -> Result<Fetched<T>, FetchError> {
        let request = self.endpoint.build(params)?;
        let key = self.endpoint.cache_key(params);
        self.fetcher.fetch(&key, request, options).await
    }

    /// One result per parameter set, in order.
    pub async fn get_many(
        &self,
        param_sets: &[Vec<(&str, &str)>],
    ) -> Vec<Result<Fetched<T>, FetchError>> {
        self.runner
            .fetch_all(
                &self.fetcher,
                param_sets,
                FetchOptions::default(),
                |params| {
                    let request = self.endpoint.build(params)?;
                    Ok((self.endpoint.cache_key(params), request))
                },
            )
            .await
    }
}
