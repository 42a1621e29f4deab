//! Prometheus recorder for `--print-metrics`
//!
//! The metric names and bucket boundaries are owned by `broker_api::telemetry`;
//! this module only installs the exporter and renders it.

use broker_api::telemetry::{
    ADMISSION_WAIT_BUCKETS, ADMISSION_WAIT_SECONDS, DURATION_BUCKETS, REQUEST_DURATION_SECONDS,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Builder with histogram buckets so durations render as `_bucket` lines
/// rather than summaries.
fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(REQUEST_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(ADMISSION_WAIT_SECONDS.to_string()),
            ADMISSION_WAIT_BUCKETS,
        )
}

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(builder()?.install_recorder()?)
}
