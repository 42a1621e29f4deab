//! Request metrics
//!
//! Recorded through the `metrics` facade; the binary decides whether a
//! Prometheus recorder is installed. Without one these calls are no-ops.
//!
//! - `broker_api_requests_total` (counter): labels `method`, `outcome`
//! - `broker_api_request_duration_seconds` (histogram): label `outcome`
//! - `broker_api_retries_total` (counter): label `reason`
//! - `broker_api_admission_wait_seconds` (histogram)
//! - `broker_api_credential_lookups_total` (counter): label `result`

pub const REQUESTS_TOTAL: &str = "broker_api_requests_total";
pub const REQUEST_DURATION_SECONDS: &str = "broker_api_request_duration_seconds";
pub const RETRIES_TOTAL: &str = "broker_api_retries_total";
pub const ADMISSION_WAIT_SECONDS: &str = "broker_api_admission_wait_seconds";
pub const CREDENTIAL_LOOKUPS_TOTAL: &str = "broker_api_credential_lookups_total";

/// Histogram boundaries for request duration, 5ms to 60s.
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Histogram boundaries for time spent in the rate gate queue.
pub const ADMISSION_WAIT_BUCKETS: &[f64] = &[0.0, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 30.0];

/// Record a finished logical request. `outcome` is `success` or an `ErrorKind` label.
pub fn record_request(method: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(REQUESTS_TOTAL, "method" => method.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    metrics::histogram!(REQUEST_DURATION_SECONDS, "outcome" => outcome.to_string())
        .record(duration_secs);
}

pub fn record_retry(reason: &str) {
    metrics::counter!(RETRIES_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_admission_wait(wait_secs: f64) {
    metrics::histogram!(ADMISSION_WAIT_SECONDS).record(wait_secs);
}

/// Record where `auth_headers` found its credential: `hit`, `captured`, `degraded`, or `failed`.
pub fn record_credential_lookup(result: &str) {
    metrics::counter!(CREDENTIAL_LOOKUPS_TOTAL, "result" => result.to_string()).increment(1);
}
