//! Timeout-bounded forwarder.
//!
//! Executes one outbound request under a deadline. The deadline covers the
//! call up to the arrival of the response head; streamed bodies are bounded
//! by the stream tap's cancellation instead.

use crate::core::config::UpstreamConfig;
use crate::core::metrics::get_metrics;
use crate::core::{AppError, Result};
use crate::proxy::translate::OutboundRequest;
use crate::proxy::ByteStream;
use axum::http::{HeaderMap, StatusCode};
use futures::StreamExt;
use reqwest::{redirect, Client};
use std::time::Duration;

/// Build the shared upstream client.
///
/// Redirects are never followed: a 3xx is relayed to the caller as-is, so a
/// streamed request body is never replayed. No whole-request timeout is set
/// on the client, long streams are only bounded by [`Forwarder`]'s deadline
/// on the response head.
pub fn build_http_client(config: &UpstreamConfig) -> reqwest::Result<Client> {
    Client::builder()
        .redirect(redirect::Policy::none())
        .danger_accept_invalid_certs(!config.verify_ssl)
        .pool_max_idle_per_host(100)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .http2_keep_alive_timeout(Duration::from_secs(10))
        .build()
}

/// Upstream answer as seen by the relay.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Single-consumption body
    pub body: ByteStream,
}

impl UpstreamResponse {
    pub fn from_reqwest(response: reqwest::Response) -> Self {
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other))
            .boxed();
        Self {
            status,
            headers,
            body,
        }
    }
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct Forwarder {
    client: Client,
    deadline: Duration,
}

impl Forwarder {
    pub fn new(client: Client, deadline: Duration) -> Self {
        Self { client, deadline }
    }

    pub fn from_config(client: Client, config: &UpstreamConfig) -> Self {
        Self::new(client, Duration::from_secs(config.request_timeout_secs))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Execute `request` once.
    ///
    /// On expiry the in-flight call future is dropped, which aborts the
    /// connection attempt. The deadline timer is owned by the `timeout`
    /// future and is released on every return path.
    pub async fn forward(&self, request: OutboundRequest) -> Result<UpstreamResponse> {
        let request = request.into_inner();
        let method = request.method().clone();
        let url = request.url().clone();

        let result = match tokio::time::timeout(self.deadline, self.client.execute(request)).await
        {
            Ok(Ok(response)) => Ok(UpstreamResponse::from_reqwest(response)),
            Ok(Err(e)) => Err(AppError::Upstream(e)),
            Err(_) => Err(AppError::UpstreamTimeout {
                after: self.deadline,
            }),
        };

        match &result {
            Ok(response) => {
                tracing::debug!(
                    method = %method,
                    url = %url,
                    status = response.status.as_u16(),
                    "Upstream responded"
                );
            }
            Err(e) => {
                get_metrics()
                    .upstream_errors
                    .with_label_values(&[e.kind()])
                    .inc();
                tracing::error!(method = %method, url = %url, error = %e, "Upstream call failed");
            }
        }
        result
    }
}
