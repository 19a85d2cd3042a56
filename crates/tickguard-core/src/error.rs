use thiserror::Error;

use crate::http_client::{HttpError, HttpErrorKind};

/// Classified failure of a resilient fetch.
///
/// Every upstream problem is mapped onto one of these variants before it
/// reaches the caller; callers treat any of them as "data unavailable this
/// cycle".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("circuit breaker for '{endpoint}' is open")]
    CircuitOpen { endpoint: String },

    #[error("local request budget for '{endpoint}' is exhausted")]
    RateLimited { endpoint: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream returned HTTP {status}")]
    Status { status: u16, retryable: bool },

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchError {
    /// Maps a transport failure. Timeouts and network errors are retryable;
    /// construction failures are not.
    pub fn from_transport(error: &HttpError) -> Self {
        match error.kind() {
            HttpErrorKind::Timeout => Self::Timeout(error.message().to_string()),
            HttpErrorKind::Connect | HttpErrorKind::Other => {
                Self::Network(error.message().to_string())
            }
            HttpErrorKind::InvalidRequest => Self::InvalidRequest(error.message().to_string()),
        }
    }

    /// Whether another attempt could plausibly succeed.
    pub const fn retryable(&self) -> bool {
        match self {
            Self::Status { retryable, .. } => *retryable,
            Self::Timeout(_) | Self::Network(_) => true,
            Self::CircuitOpen { .. }
            | Self::RateLimited { .. }
            | Self::InvalidRequest(_)
            | Self::MalformedResponse(_) => false,
        }
    }

    /// Local rejections that never reached the network.
    pub const fn is_local_rejection(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. } | Self::RateLimited { .. })
    }

    /// Programming or configuration errors: never retried, counted against
    /// the breaker, or hidden behind cached data.
    pub const fn is_invalid_request(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }

    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub const fn code(&self) -> &'static str {
        match self {
            Self::CircuitOpen { .. } => "fetch.circuit_open",
            Self::RateLimited { .. } => "fetch.rate_limited",
            Self::InvalidRequest(_) => "fetch.invalid_request",
            Self::Status { .. } => "fetch.http_status",
            Self::Timeout(_) => "fetch.timeout",
            Self::Network(_) => "fetch.network",
            Self::MalformedResponse(_) => "fetch.malformed_response",
        }
    }
}

/// Invalid resilience configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("field '{field}' must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("invalid eviction policy '{value}', expected one of lru, lfu, ttl")]
    InvalidEvictionPolicy { value: String },

    #[error("environment variable '{name}' has invalid value '{value}'")]
    InvalidEnv { name: String, value: String },

    #[error("invalid configuration document: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(error: serde_json::Error) -> Self {
        Self::Parse(error.to_string())
    }
}
