//! Prometheus metrics exposition
//!
//! - `gateway_requests_total` (counter): labels `status`, `endpoint`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//! - `gateway_account_rotations_total` (counter, recorded by the pool)
//! - `gateway_session_refresh_total` (counter, recorded by the refresh task)

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "gateway_request_duration_seconds";

/// 5ms to 60s; streamed completions routinely run tens of seconds.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("failed to set histogram buckets")
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed caller request.
pub fn record_request(status: u16, endpoint: &str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "gateway_requests_total",
        "status" => status_str.clone(),
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status_str).record(duration_secs);
}

/// Record a failed backend interaction by kind (`rate_limited`, `transport`, ...).
pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}
