//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! A missing config file is not an error; every field has a default that
//! matches the brokerage's public web app.

use std::path::{Path, PathBuf};
use std::time::Duration;

use broker_api::RetryPolicy;
use broker_auth::{
    AcquisitionPolicy, CachePolicy, DEFAULT_API_HOST, DEFAULT_API_PATH_MARKER, DEFAULT_CACHE_PATH,
    DEFAULT_ORIGIN,
};
use serde::Deserialize;

/// Longest credential lifetime a config may ask for.
const MAX_CREDENTIAL_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub cache: CacheConfig,
    pub acquisition: AcquisitionConfig,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryConfig,
}

/// Brokerage endpoint settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub origin: String,
    pub path_marker: String,
    /// Per-request HTTP timeout.
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_API_HOST.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
            path_marker: DEFAULT_API_PATH_MARKER.to_string(),
            timeout_secs: 30,
        }
    }
}

/// Credential cache settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub ttl_secs: u64,
    pub refresh_lookahead_secs: u64,
    pub memory_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_CACHE_PATH),
            ttl_secs: 2 * 60 * 60,
            refresh_lookahead_secs: 10 * 60,
            memory_ttl_secs: 30 * 60,
        }
    }
}

/// Session traffic capture settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub timeout_secs: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self { timeout_secs: 10 }
    }
}

/// Rate gate settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests_per_second: u32,
    pub admission_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests_per_second: broker_api::rate_gate::DEFAULT_MAX_REQUESTS_PER_SECOND,
            admission_timeout_secs: broker_api::rate_gate::DEFAULT_ADMISSION_TIMEOUT.as_secs(),
        }
    }
}

/// Retry settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub network_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            network_retries: 1,
            backoff_base_ms: 1000,
            backoff_cap_ms: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// A missing file yields the defaults. `BROKER_CACHE_PATH` overrides
    /// `cache.path`.
    pub fn load(path: &Path) -> common::Result<Self> {
        let mut config: Config = match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => return Err(e.into()),
        };

        if let Ok(p) = std::env::var("BROKER_CACHE_PATH")
            && !p.trim().is_empty()
        {
            config.cache.path = PathBuf::from(p);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.origin.starts_with("http://") && !self.api.origin.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "api.origin must start with http:// or https://, got: {}",
                self.api.origin
            )));
        }
        if self.api.host.trim().is_empty() {
            return Err(common::Error::Config("api.host must not be empty".into()));
        }
        if self.api.path_marker.trim().is_empty() {
            return Err(common::Error::Config(
                "api.path_marker must not be empty".into(),
            ));
        }

        let non_zero = [
            ("api.timeout_secs", self.api.timeout_secs),
            ("cache.ttl_secs", self.cache.ttl_secs),
            ("cache.memory_ttl_secs", self.cache.memory_ttl_secs),
            ("acquisition.timeout_secs", self.acquisition.timeout_secs),
            (
                "rate_limit.max_requests_per_second",
                u64::from(self.rate_limit.max_requests_per_second),
            ),
            (
                "rate_limit.admission_timeout_secs",
                self.rate_limit.admission_timeout_secs,
            ),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        for (name, value) in [
            ("cache.ttl_secs", self.cache.ttl_secs),
            ("cache.memory_ttl_secs", self.cache.memory_ttl_secs),
        ] {
            if value > MAX_CREDENTIAL_TTL_SECS {
                return Err(common::Error::Config(format!(
                    "{name} must be at most {MAX_CREDENTIAL_TTL_SECS} (7 days), got: {value}"
                )));
            }
        }

        if self.cache.refresh_lookahead_secs >= self.cache.ttl_secs {
            return Err(common::Error::Config(format!(
                "cache.refresh_lookahead_secs ({}) must be less than cache.ttl_secs ({})",
                self.cache.refresh_lookahead_secs, self.cache.ttl_secs
            )));
        }
        if self.retry.backoff_base_ms > self.retry.backoff_cap_ms {
            return Err(common::Error::Config(
                "retry.backoff_base_ms must not exceed retry.backoff_cap_ms".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or BROKERCTL_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("BROKERCTL_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("brokerctl.toml")
    }

    pub fn cache_policy(&self) -> CachePolicy {
        CachePolicy {
            ttl: Duration::from_secs(self.cache.ttl_secs),
            refresh_lookahead: Duration::from_secs(self.cache.refresh_lookahead_secs),
            memory_ttl: Duration::from_secs(self.cache.memory_ttl_secs),
        }
    }

    pub fn acquisition_policy(&self) -> AcquisitionPolicy {
        AcquisitionPolicy {
            api_host: self.api.host.clone(),
            path_marker: self.api.path_marker.clone(),
            origin: self.api.origin.clone(),
            timeout: Duration::from_secs(self.acquisition.timeout_secs),
            credential_ttl: Duration::from_secs(self.cache.ttl_secs),
            degraded_ttl: Duration::from_secs(self.cache.memory_ttl_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            network_retries: self.retry.network_retries,
            backoff_base: Duration::from_millis(self.retry.backoff_base_ms),
            backoff_cap: Duration::from_millis(self.retry.backoff_cap_ms),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_secs(self.rate_limit.admission_timeout_secs)
    }
}
