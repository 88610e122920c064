//! Health and metrics endpoints.

use crate::api::handlers::ProxyState;
use crate::core::metrics::render_metrics;
use crate::proxy::target::normalize_base_url;
use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Body of `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Whether usage telemetry is active
    pub telemetry: bool,
    /// Normalized upstream base URL
    pub upstream: String,
}

pub async fn health(State(state): State<ProxyState>) -> Json<HealthResponse> {
    let upstream = &state.config.upstream;
    Json(HealthResponse {
        status: "ok",
        telemetry: state.telemetry.is_some(),
        upstream: normalize_base_url(&upstream.base_url, &upstream.protocol),
    })
}

/// Prometheus text exposition.
pub async fn metrics_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render_metrics(),
    )
        .into_response()
}
