//! Application settings
//!
//! Loaded with the `config` crate from built-in defaults, an optional file
//! and `PROXY_INVENTORY__*` environment variables, in that order.

use crate::proxy::Subscription;
use crate::rules::SmartGroup;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Lowest allowed worker count
pub const MIN_CONCURRENCY: usize = 1;

/// Highest allowed worker count
pub const MAX_CONCURRENCY: usize = 20;

const ENV_PREFIX: &str = "PROXY_INVENTORY";

/// Settings consumed by the test scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Probe deadline in milliseconds
    pub timeout_ms: u64,
    /// Worker cap for manual runs
    pub concurrency: usize,
    /// Period of the unattended re-test, 0 disables it
    pub auto_test_interval_minutes: u64,
    /// Only re-test untested and inactive records in unattended mode
    pub auto_test_only_inactive: bool,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            concurrency: 5,
            auto_test_interval_minutes: 0,
            auto_test_only_inactive: true,
        }
    }
}

impl TestSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_auto_test(mut self, interval_minutes: u64, only_inactive: bool) -> Self {
        self.auto_test_interval_minutes = interval_minutes;
        self.auto_test_only_inactive = only_inactive;
        self
    }

    /// Worker count clamped to the supported range
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Interval of the unattended re-test, `None` when disabled
    pub fn auto_test_interval(&self) -> Option<Duration> {
        (self.auto_test_interval_minutes > 0)
            .then(|| Duration::from_secs(self.auto_test_interval_minutes * 60))
    }
}

/// Settings for the default HTTP prober
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProberSettings {
    /// JSON geolocation endpoint; the host is appended as the last path segment
    pub geo_endpoint: Option<String>,
    /// Offline MMDB database, preferred over the endpoint when set
    pub mmdb_path: Option<String>,
    pub user_agent: String,
}

impl Default for ProberSettings {
    fn default() -> Self {
        Self {
            geo_endpoint: Some("http://ip-api.com/json".to_string()),
            mmdb_path: None,
            user_agent: format!("proxy-inventory/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Optional file receiving every event without ANSI colours
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Top-level application settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub test: TestSettings,
    pub prober: ProberSettings,
    pub log: LoggingConfig,
    pub subscriptions: Vec<Subscription>,
    pub smart_groups: Vec<SmartGroup>,
}

impl Settings {
    /// Load settings, layering an optional file and the environment over defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
