//! HTTP surface of the proxy.
//!
//! Everything under the proxy prefix goes to [`handlers::proxy_handler`];
//! `/health` and `/metrics` are served locally.

pub mod handlers;
pub mod health;

pub use handlers::{proxy_handler, ProxyState};
pub use health::{health, metrics_handler, HealthResponse};

use crate::core::{request_id_middleware, MetricsMiddleware};
use axum::{
    routing::{any, get},
    Router,
};
use tower_http::trace::TraceLayer;

/// Route pattern matching every path under `prefix`.
pub fn proxy_route(prefix: &str) -> String {
    format!("{}/*path", prefix.trim_end_matches('/'))
}

/// Build the application router.
pub fn build_router(state: ProxyState) -> Router {
    let proxy_routes: Router = Router::new()
        .route(
            &proxy_route(&state.config.upstream.proxy_prefix),
            any(proxy_handler),
        )
        .layer(axum::middleware::from_fn(MetricsMiddleware::track_metrics))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(proxy_routes)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}
