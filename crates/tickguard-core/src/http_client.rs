use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::FetchError;
use crate::lock_unpoisoned;

/// Credential carried on outgoing requests. Supplied by the caller; never
/// logged.
#[derive(Clone, PartialEq, Eq)]
pub enum HttpAuth {
    None,
    BearerToken(String),
    Header { name: String, value: String },
    /// API key passed as a query parameter, e.g. `apikey=...`.
    QueryParam { name: String, value: String },
}

impl std::fmt::Debug for HttpAuth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::BearerToken(_) => f.write_str("BearerToken(***)"),
            Self::Header { name, .. } => write!(f, "Header({name}: ***)"),
            Self::QueryParam { name, .. } => write!(f, "QueryParam({name}=***)"),
        }
    }
}

impl HttpAuth {
    /// Adds header-based credentials. Query-parameter credentials are applied
    /// when the URL is built.
    pub fn apply(&self, headers: &mut BTreeMap<String, String>) {
        match self {
            Self::None | Self::QueryParam { .. } => {}
            Self::BearerToken(token) => {
                headers.insert(String::from("authorization"), format!("Bearer {token}"));
            }
            Self::Header { name, value } => {
                headers.insert(name.to_ascii_lowercase(), value.clone());
            }
        }
    }

    pub fn query_param(&self) -> Option<(&str, &str)> {
        match self {
            Self::QueryParam { name, value } => Some((name.as_str(), value.as_str())),
            _ => None,
        }
    }
}

/// GET request handed to the transport. Upstream reads are always GETs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub timeout_ms: u64,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: BTreeMap::new(),
            timeout_ms: 10_000,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_auth(mut self, auth: &HttpAuth) -> Self {
        auth.apply(&mut self.headers);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Rejects requests that could never succeed: non-absolute or non-HTTP
    /// URLs and a zero timeout.
    pub fn validate(&self) -> Result<(), FetchError> {
        let url = reqwest::Url::parse(&self.url).map_err(|error| {
            FetchError::InvalidRequest(format!("invalid url '{}': {error}", self.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidRequest(format!(
                "unsupported url scheme '{}'",
                url.scheme()
            )));
        }
        if self.timeout_ms == 0 {
            return Err(FetchError::InvalidRequest(String::from(
                "request timeout must be greater than zero",
            )));
        }
        Ok(())
    }
}

/// HTTP response envelope returned by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok_json(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Transport failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpErrorKind {
    Timeout,
    Connect,
    /// The request could not be constructed; retrying cannot help.
    InvalidRequest,
    Other,
}

/// Transport-level HTTP error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpError {
    kind: HttpErrorKind,
    message: String,
}

impl HttpError {
    pub fn new(kind: HttpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Timeout, message)
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Connect, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::InvalidRequest, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(HttpErrorKind::Other, message)
    }

    pub const fn kind(&self) -> HttpErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for HttpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for HttpError {}

/// Outbound transport contract.
pub trait HttpClient: Send + Sync {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>>;
}

/// Production HTTP client using reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: Arc<reqwest::Client>,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: Arc::new(
                reqwest::Client::builder()
                    .user_agent(concat!("tickguard/", env!("CARGO_PKG_VERSION")))
                    .build()
                    .unwrap_or_else(|_| reqwest::Client::new()),
            ),
        }
    }

    /// Create a ReqwestHttpClient with a custom reqwest::Client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Arc::new(client),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let mut builder = self.client.get(&request.url);

            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            builder = builder.timeout(request.timeout());

            // Query strings may carry credentials; keep them out of messages.
            let response = builder.send().await.map_err(|e| {
                let e = e.without_url();
                if e.is_builder() {
                    HttpError::invalid_request(format!("request could not be built: {e}"))
                } else if e.is_timeout() {
                    HttpError::timeout(format!("request timeout: {e}"))
                } else if e.is_connect() {
                    HttpError::connect(format!("connection failed: {e}"))
                } else {
                    HttpError::other(format!("request failed: {e}"))
                }
            })?;

            let status = response.status().as_u16();
            let body = response.text().await.map_err(|e| {
                let e = e.without_url();
                if e.is_timeout() {
                    HttpError::timeout(format!("timed out reading response body: {e}"))
                } else {
                    HttpError::other(format!("failed to read response body: {e}"))
                }
            })?;

            Ok(HttpResponse { status, body })
        })
    }
}

#[derive(Debug, Default)]
struct ScriptInner {
    queue: VecDeque<Result<HttpResponse, HttpError>>,
    repeat: Option<Result<HttpResponse, HttpError>>,
    requests: Vec<HttpRequest>,
}

/// In-memory transport for deterministic offline tests.
///
/// Replays queued outcomes in order; once the queue is drained it keeps
/// returning the outcome set with [`ScriptedHttpClient::always`], or a
/// connection error if none was set. Every request is recorded.
#[derive(Debug, Default)]
pub struct ScriptedHttpClient {
    inner: Mutex<ScriptInner>,
}

impl ScriptedHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, status: u16, body: impl Into<String>) -> Self {
        self.push(Ok(HttpResponse::new(status, body)));
        self
    }

    pub fn fail(self, error: HttpError) -> Self {
        self.push(Err(error));
        self
    }

    pub fn always(self, outcome: Result<HttpResponse, HttpError>) -> Self {
        lock_unpoisoned(&self.inner).repeat = Some(outcome);
        self
    }

    pub fn push(&self, outcome: Result<HttpResponse, HttpError>) {
        lock_unpoisoned(&self.inner).queue.push_back(outcome);
    }

    /// Number of requests executed so far.
    pub fn calls(&self) -> usize {
        lock_unpoisoned(&self.inner).requests.len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock_unpoisoned(&self.inner).requests.clone()
    }
}

impl HttpClient for ScriptedHttpClient {
    fn execute<'a>(
        &'a self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        let outcome = {
            let mut inner = lock_unpoisoned(&self.inner);
            inner.requests.push(request);
            match inner.queue.pop_front() {
                Some(outcome) => outcome,
                None => inner
                    .repeat
                    .clone()
                    .unwrap_or_else(|| Err(HttpError::connect("no scripted response left"))),
            }
        };
        Box::pin(std::future::ready(outcome))
    }
}
