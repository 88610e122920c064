//! Prometheus metrics for monitoring the chat proxy server.
//!
//! This module provides a centralized metrics registry for tracking requests,
//! latency, policy decisions, upstream failures and usage telemetry.

use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter, register_int_counter_vec, Gauge,
    HistogramVec, IntCounter, IntCounterVec,
};
use std::sync::OnceLock;

/// Container for all application metrics.
pub struct Metrics {
    /// Total number of proxied requests by method and status
    pub request_count: IntCounterVec,

    /// Time until response headers were ready, in seconds
    pub request_duration: HistogramVec,

    /// Number of requests currently being proxied
    pub active_requests: Gauge,

    /// Requests refused by the model policy gate
    pub policy_rejections: IntCounterVec,

    /// Upstream failures by kind (timeout, connect, other)
    pub upstream_errors: IntCounterVec,

    /// Sum of usage counts across all emitted usage records
    pub usage_tokens: IntCounter,

    /// Usage records by delivery outcome (ingested, failed)
    pub usage_records: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Initialize the metrics registry.
///
/// This should be called once at application startup. Subsequent calls will
/// return the same instance.
///
/// # Examples
///
/// ```no_run
/// use chat_proxy_rust::core::metrics::init_metrics;
///
/// let metrics = init_metrics();
/// metrics.request_count.with_label_values(&["GET", "200"]).inc();
/// ```
pub fn init_metrics() -> &'static Metrics {
    METRICS.get_or_init(|| {
        let request_count = register_int_counter_vec!(
            "chat_proxy_requests_total",
            "Total number of proxied requests",
            &["method", "status_code"]
        )
        .expect("Failed to register request_count metric");

        let request_duration = register_histogram_vec!(
            "chat_proxy_request_duration_seconds",
            "Time until response headers were ready, in seconds",
            &["method"],
            vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]
        )
        .expect("Failed to register request_duration metric");

        let active_requests = register_gauge!(
            "chat_proxy_active_requests",
            "Number of requests currently being proxied"
        )
        .expect("Failed to register active_requests metric");

        let policy_rejections = register_int_counter_vec!(
            "chat_proxy_policy_rejections_total",
            "Requests rejected by the model policy gate",
            &["model"]
        )
        .expect("Failed to register policy_rejections metric");

        let upstream_errors = register_int_counter_vec!(
            "chat_proxy_upstream_errors_total",
            "Upstream call failures",
            &["kind"]
        )
        .expect("Failed to register upstream_errors metric");

        let usage_tokens = register_int_counter!(
            "chat_proxy_usage_tokens_total",
            "Sum of usage counts across emitted usage records"
        )
        .expect("Failed to register usage_tokens metric");

        let usage_records = register_int_counter_vec!(
            "chat_proxy_usage_records_total",
            "Usage records by delivery outcome",
            &["outcome"]
        )
        .expect("Failed to register usage_records metric");

        Metrics {
            request_count,
            request_duration,
            active_requests,
            policy_rejections,
            upstream_errors,
            usage_tokens,
            usage_records,
        }
    })
}

/// Get the global metrics instance.
///
/// Initializes the registry on first use, so background tasks and tests
/// never observe an uninitialized registry.
pub fn get_metrics() -> &'static Metrics {
    init_metrics()
}

/// Render all registered metrics in the Prometheus text format.
pub fn render_metrics() -> String {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
