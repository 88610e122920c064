//! HTTP middleware for request tracking and metrics.

use crate::core::logging::{generate_request_id, REQUEST_ID};
use crate::core::metrics::get_metrics;
use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;

/// Response header carrying the request id assigned by the proxy.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Assign a request id and run the rest of the stack inside its scope.
///
/// The id is echoed back only when the response has no `x-request-id` of its
/// own; an upstream's id is relayed untouched.
pub async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = generate_request_id();
    let header_value = HeaderValue::from_str(&request_id).ok();

    let mut response = REQUEST_ID.scope(request_id, next.run(request)).await;

    if let Some(value) = header_value {
        response
            .headers_mut()
            .entry(X_REQUEST_ID)
            .or_insert(value);
    }
    response
}

/// Middleware for tracking request metrics.
pub struct MetricsMiddleware;

impl MetricsMiddleware {
    /// Track metrics for proxied requests.
    ///
    /// Duration is measured until the response headers are ready; streamed
    /// bodies keep flowing after this middleware returns.
    pub async fn track_metrics(request: Request, next: Next) -> Response {
        let method = request.method().to_string();
        let path = request.uri().path().to_string();

        let metrics = get_metrics();
        metrics.active_requests.inc();
        let start = Instant::now();

        let response = next.run(request).await;

        let duration = start.elapsed().as_secs_f64();
        let status_code = response.status().as_u16().to_string();
        metrics.active_requests.dec();

        metrics
            .request_count
            .with_label_values(&[&method, &status_code])
            .inc();
        metrics
            .request_duration
            .with_label_values(&[&method])
            .observe(duration);

        tracing::info!(
            method = %method,
            path = %path,
            status = %status_code,
            duration_ms = (duration * 1000.0) as u64,
            "Proxy request"
        );

        response
    }
}
