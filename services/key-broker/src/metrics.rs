//! Prometheus metrics exposition
//!
//! The pool crate records `key_pool_*` counters through the `metrics` facade;
//! this module installs the Prometheus recorder that collects them and adds
//! the broker's own request metrics:
//!
//! - `broker_requests_total` (counter): labels `route`, `status`
//! - `broker_request_duration_seconds` (histogram): label `route`

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets for request latency, 1ms to 5s. Acquire is one store
/// round-trip, so anything past a few seconds means the store is stuck.
const DURATION_BUCKETS: &[f64] = &[0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("broker_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("failed to set histogram buckets")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The handle's `render()` method produces the Prometheus text exposition format
/// suitable for serving on a `/metrics` endpoint.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a handled request with its route and status code.
pub fn record_request(route: &'static str, status: u16, duration_secs: f64) {
    metrics::counter!("broker_requests_total", "route" => route, "status" => status.to_string())
        .increment(1);
    metrics::histogram!("broker_request_duration_seconds", "route" => route).record(duration_secs);
}
