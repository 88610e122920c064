//! The catch-all proxy handler and its shared state.

use crate::core::logging::{get_request_id, REQUEST_ID};
use crate::core::{AppConfig, Result, StreamCancelHandle, TelemetrySink};
use crate::proxy::usage::run_usage_accumulator;
use crate::proxy::{
    build_outbound, relay_response, tap, Forwarder, ModelPolicy, PolicyDecision, ProxyRequest,
    TapBranch, UpstreamTarget, UsageAccumulator,
};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Uri},
    response::Response,
};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// State shared by every proxied request.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<AppConfig>,
    pub forwarder: Forwarder,
    pub policy: Arc<ModelPolicy>,
    /// Usage sink; `None` disables the stream tap entirely
    pub telemetry: Option<Arc<dyn TelemetrySink>>,
    /// Background usage accumulators
    pub background: TaskTracker,
    /// Fired at shutdown to stop in-flight stream taps
    pub shutdown: StreamCancelHandle,
}

impl ProxyState {
    pub fn new(
        config: AppConfig,
        client: reqwest::Client,
        telemetry: Option<Arc<dyn TelemetrySink>>,
    ) -> Self {
        let forwarder = Forwarder::from_config(client, &config.upstream);
        let policy = Arc::new(ModelPolicy::new(&config.policy));
        Self {
            config: Arc::new(config),
            forwarder,
            policy,
            telemetry,
            background: TaskTracker::new(),
            shutdown: StreamCancelHandle::new(),
        }
    }
}

/// Forward any request under the proxy prefix to upstream.
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let target = UpstreamTarget::resolve(&state.config.upstream, path_and_query);
    tracing::debug!(
        path = %target.path,
        base_url = %target.base_url(),
        "Resolved upstream target"
    );
    let org_id = state
        .config
        .upstream
        .org_id
        .as_deref()
        .filter(|id| !id.is_empty());
    if org_id.is_some() {
        tracing::debug!("Attaching organization id");
    }

    let request = ProxyRequest::capture(
        method,
        path_and_query,
        &headers,
        body,
        state.config.server.max_body_bytes,
    )
    .await?;

    if let PolicyDecision::Reject { model } = state.policy.check(&request) {
        return Ok(state.policy.rejection(&model));
    }

    let usage = match &state.telemetry {
        Some(_) if request.is_write() => UsageAccumulator::for_request(&request),
        _ => None,
    };

    let outbound = build_outbound(request, &target, org_id)?;
    let upstream = state.forwarder.forward(outbound).await?;

    let body = match (usage, state.telemetry.clone()) {
        (Some(accumulator), Some(sink)) => {
            let (caller, observer) = tap(upstream.body, state.shutdown.clone());
            spawn_usage_accumulator(&state, observer, accumulator, sink);
            Body::from_stream(caller)
        }
        _ => Body::from_stream(upstream.body),
    };

    Ok(relay_response(upstream.status, &upstream.headers, body))
}

/// Run the accumulator on the background tracker, detached from the reply.
fn spawn_usage_accumulator(
    state: &ProxyState,
    observer: TapBranch,
    accumulator: UsageAccumulator,
    sink: Arc<dyn TelemetrySink>,
) {
    let dataset = state.config.telemetry.dataset.clone();
    let request_id = get_request_id();
    let span = tracing::debug_span!("usage", request_id = %request_id);

    state.background.spawn(
        REQUEST_ID
            .scope(request_id, async move {
                run_usage_accumulator(observer, accumulator, sink.as_ref(), &dataset).await;
            })
            .instrument(span),
    );
}
