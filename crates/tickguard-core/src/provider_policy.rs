use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ResilienceConfig;
use crate::duration_ms;
use crate::error::ConfigError;

/// Outbound integration families that share a resilience profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationKind {
    MarketData,
    News,
    Polling,
    Social,
    EventDiscovery,
}

impl IntegrationKind {
    pub const ALL: [Self; 5] = [
        Self::MarketData,
        Self::News,
        Self::Polling,
        Self::Social,
        Self::EventDiscovery,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MarketData => "market_data",
            Self::News => "news",
            Self::Polling => "polling",
            Self::Social => "social",
            Self::EventDiscovery => "event_discovery",
        }
    }

    /// Environment variable prefix, e.g. `TICKGUARD_MARKET_DATA`.
    pub fn env_prefix(self) -> String {
        format!("TICKGUARD_{}", self.as_str().to_ascii_uppercase())
    }
}

impl Display for IntegrationKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrationKind {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value.trim())
            .ok_or_else(|| ConfigError::Parse(format!("unknown integration kind '{value}'")))
    }
}

/// Quota and freshness profile for one integration family.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPolicy {
    pub kind: IntegrationKind,
    /// Parallel requests a batch may keep in flight.
    pub max_concurrency: usize,
    pub quota_window: Duration,
    pub quota_limit: u32,
    pub cache_ttl: Duration,
    pub stale_grace: Duration,
    pub max_retries: u32,
}

impl ProviderPolicy {
    /// Free-tier quote APIs allow a handful of calls per minute.
    pub fn market_data_default() -> Self {
        Self {
            kind: IntegrationKind::MarketData,
            max_concurrency: 1,
            quota_window: Duration::from_secs(60),
            quota_limit: 5,
            cache_ttl: Duration::from_secs(60),
            stale_grace: Duration::from_secs(15 * 60),
            max_retries: 3,
        }
    }

    pub fn news_default() -> Self {
        Self {
            kind: IntegrationKind::News,
            max_concurrency: 2,
            quota_window: Duration::from_secs(24 * 60 * 60),
            quota_limit: 100,
            cache_ttl: Duration::from_secs(15 * 60),
            stale_grace: Duration::from_secs(6 * 60 * 60),
            max_retries: 2,
        }
    }

    pub fn polling_default() -> Self {
        Self {
            kind: IntegrationKind::Polling,
            max_concurrency: 4,
            quota_window: Duration::from_secs(60),
            quota_limit: 60,
            cache_ttl: Duration::from_secs(60 * 60),
            stale_grace: Duration::from_secs(24 * 60 * 60),
            max_retries: 3,
        }
    }

    pub fn social_default() -> Self {
        Self {
            kind: IntegrationKind::Social,
            max_concurrency: 2,
            quota_window: Duration::from_secs(15 * 60),
            quota_limit: 30,
            cache_ttl: Duration::from_secs(5 * 60),
            stale_grace: Duration::from_secs(60 * 60),
            max_retries: 2,
        }
    }

    pub fn event_discovery_default() -> Self {
        Self {
            kind: IntegrationKind::EventDiscovery,
            max_concurrency: 4,
            quota_window: Duration::from_secs(60),
            quota_limit: 60,
            cache_ttl: Duration::from_secs(10 * 60),
            stale_grace: Duration::from_secs(2 * 60 * 60),
            max_retries: 3,
        }
    }

    pub fn default_for(kind: IntegrationKind) -> Self {
        match kind {
            IntegrationKind::MarketData => Self::market_data_default(),
            IntegrationKind::News => Self::news_default(),
            IntegrationKind::Polling => Self::polling_default(),
            IntegrationKind::Social => Self::social_default(),
            IntegrationKind::EventDiscovery => Self::event_discovery_default(),
        }
    }

    /// Token bucket that allows the whole quota as a burst and refills it
    /// evenly across the window.
    pub fn to_config(&self) -> ResilienceConfig {
        let limit = self.quota_limit.max(1);
        let window_seconds = self.quota_window.as_secs_f64().max(0.001);

        ResilienceConfig {
            capacity: f64::from(limit),
            refill_rate_per_second: f64::from(limit) / window_seconds,
            default_ttl_ms: duration_ms(self.cache_ttl),
            stale_grace_ms: duration_ms(self.stale_grace),
            max_retries: self.max_retries,
            ..ResilienceConfig::default()
        }
    }

    /// [`ProviderPolicy::to_config`] with `TICKGUARD_<KIND>_*` overrides.
    pub fn config_from_env(&self) -> Result<ResilienceConfig, ConfigError> {
        self.to_config()
            .with_overrides(&self.kind.env_prefix(), |name| std::env::var(name).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_data_policy_matches_free_tier() {
        let policy = ProviderPolicy::market_data_default();

        assert_eq!(policy.kind, IntegrationKind::MarketData);
        assert_eq!(policy.max_concurrency, 1);
        assert_eq!(policy.quota_window, Duration::from_secs(60));
        assert_eq!(policy.quota_limit, 5);
    }

    #[test]
    fn quota_becomes_burst_capacity_and_even_refill() {
        let config = ProviderPolicy::polling_default().to_config();

        assert_eq!(config.capacity, 60.0);
        assert_eq!(config.refill_rate_per_second, 1.0);
        assert_eq!(config.default_ttl_ms, 3_600_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn every_kind_has_a_valid_default() {
        for kind in IntegrationKind::ALL {
            let policy = ProviderPolicy::default_for(kind);
            assert_eq!(policy.kind, kind);
            assert!(policy.to_config().validate().is_ok(), "kind {kind}");
            assert_eq!(kind.as_str().parse::<IntegrationKind>().ok(), Some(kind));
        }
        assert_eq!(IntegrationKind::News.env_prefix(), "TICKGUARD_NEWS");
    }
}
