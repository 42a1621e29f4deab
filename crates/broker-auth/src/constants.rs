//! Brokerage endpoint constants and cache defaults
//!
//! These describe the public trading site, not secrets. Every value here can be
//! overridden through `AcquisitionPolicy` / `CachePolicy`.

use std::time::Duration;

/// Host serving the brokerage's private JSON API.
pub const DEFAULT_API_HOST: &str = "api-mts.orbis.easytrader.ir";

/// Path fragment identifying authenticated API calls in session traffic.
pub const DEFAULT_API_PATH_MARKER: &str = "/api/v2/";

/// Origin of the trading web app (sent as `Origin` and, with a slash, `Referer`).
pub const DEFAULT_ORIGIN: &str = "https://d.easytrader.ir";

/// Default durable cache location, relative to the working directory.
pub const DEFAULT_CACHE_PATH: &str = ".user-data/easy/token-cache.json";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const ACCEPT_JSON: &str = "application/json, text/plain, */*";
pub const ACCEPT_LANGUAGE: &str = "fa";

/// Lifetime of a captured credential in the durable cache.
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(2 * 60 * 60);

/// How long before expiry a cached credential is flagged for refresh.
pub const DEFAULT_REFRESH_LOOKAHEAD: Duration = Duration::from_secs(10 * 60);

/// Lifetime of the in-process slot (also the lifetime of degraded credentials).
pub const DEFAULT_MEMORY_TTL: Duration = Duration::from_secs(30 * 60);

/// How long capture waits for a qualifying request before degrading.
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);
