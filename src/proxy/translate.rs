//! Inbound request capture and outbound request construction.

use crate::core::{AppError, Result};
use crate::proxy::target::UpstreamTarget;
use axum::body::{Body, Bytes, HttpBody};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use serde_json::{Map, Value};

/// Header carrying the configured OpenAI organization id.
pub const OPENAI_ORGANIZATION: HeaderName = HeaderName::from_static("openai-organization");

/// Length of the `Bearer ` scheme prefix stripped to form the caller key.
const CREDENTIAL_PREFIX_LEN: usize = 7;

/// Methods whose body is parsed, policy-checked and reported to telemetry.
pub fn is_write_method(method: &Method) -> bool {
    method == Method::POST
}

/// Whether a write body should be buffered and parsed.
///
/// Untyped bodies are treated as JSON, since chat clients often omit the
/// header. Anything explicitly typed otherwise (multipart uploads, audio)
/// is streamed.
fn is_json_content(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(header::CONTENT_TYPE) else {
        return true;
    };
    let Ok(value) = value.to_str() else {
        return false;
    };
    let essence = value.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    essence == "application/json" || essence.ends_with("+json")
}

/// Body of an inbound request.
#[derive(Debug)]
pub enum ProxyBody {
    /// Write request with a JSON body
    Json(Value),
    /// JSON-typed write body that failed to parse; forwarded byte for byte
    Raw(Bytes),
    /// Non-JSON write body or any other method; streamed without buffering
    Stream(Body),
    Empty,
}

/// An inbound request, captured once per call.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub path_and_query: String,
    pub authorization: Option<HeaderValue>,
    pub body: ProxyBody,
}

impl ProxyRequest {
    /// Capture an inbound request.
    ///
    /// JSON write bodies are buffered and parsed, up to `max_body_bytes`
    /// when a limit is set. Every other body is left as a stream.
    pub async fn capture(
        method: Method,
        path_and_query: impl Into<String>,
        headers: &HeaderMap,
        body: Body,
        max_body_bytes: Option<usize>,
    ) -> Result<Self> {
        let authorization = headers.get(header::AUTHORIZATION).cloned();

        let body = if is_write_method(&method) && is_json_content(headers) {
            let limit = max_body_bytes.unwrap_or(usize::MAX);
            let bytes = axum::body::to_bytes(body, limit)
                .await
                .map_err(|e| AppError::BadRequest(format!("Failed to read request body: {e}")))?;
            if bytes.is_empty() {
                ProxyBody::Empty
            } else {
                match serde_json::from_slice::<Value>(&bytes) {
                    Ok(json) => ProxyBody::Json(json),
                    Err(e) => {
                        tracing::warn!(error = %e, "Request body is not JSON, forwarding as-is");
                        ProxyBody::Raw(bytes)
                    }
                }
            }
        } else if body.size_hint().exact() == Some(0) {
            ProxyBody::Empty
        } else {
            ProxyBody::Stream(body)
        };

        Ok(Self {
            method,
            path_and_query: path_and_query.into(),
            authorization,
            body,
        })
    }

    pub fn is_write(&self) -> bool {
        is_write_method(&self.method)
    }

    /// Parsed JSON body, for write requests that carried one.
    pub fn json_body(&self) -> Option<&Value> {
        match &self.body {
            ProxyBody::Json(json) => Some(json),
            _ => None,
        }
    }

    /// Parsed JSON body when it is an object.
    pub fn json_object(&self) -> Option<&Map<String, Value>> {
        self.json_body().and_then(Value::as_object)
    }

    /// Caller identity fragment: the credential with its 7-character scheme
    /// prefix removed.
    pub fn credential_key(&self) -> Option<String> {
        let value = self.authorization.as_ref()?.to_str().ok()?;
        Some(value.chars().skip(CREDENTIAL_PREFIX_LEN).collect())
    }
}

/// A fully built upstream request, handed to the forwarder.
#[derive(Debug)]
pub struct OutboundRequest {
    request: reqwest::Request,
}

impl OutboundRequest {
    pub fn into_inner(self) -> reqwest::Request {
        self.request
    }

    #[cfg(test)]
    fn method(&self) -> &Method {
        self.request.method()
    }

    #[cfg(test)]
    fn url(&self) -> &reqwest::Url {
        self.request.url()
    }

    #[cfg(test)]
    fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    /// Buffered body bytes, `None` for streamed or absent bodies.
    #[cfg(test)]
    fn body_bytes(&self) -> Option<&[u8]> {
        self.request.body().and_then(reqwest::Body::as_bytes)
    }
}

/// Build the outbound request for `request`.
///
/// Headers are replaced, not merged: only the credential is passed through,
/// alongside the forced content type, `Cache-Control: no-store` and the
/// optional organization id.
pub fn build_outbound(
    request: ProxyRequest,
    target: &UpstreamTarget,
    org_id: Option<&str>,
) -> Result<OutboundRequest> {
    let url = target.to_url()?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    if let Some(authorization) = request.authorization {
        headers.insert(header::AUTHORIZATION, authorization);
    }
    if let Some(org_id) = org_id.filter(|id| !id.is_empty()) {
        let value = HeaderValue::from_str(org_id)
            .map_err(|e| AppError::Internal(format!("Invalid organization id: {e}")))?;
        headers.insert(OPENAI_ORGANIZATION, value);
    }

    let mut outbound = reqwest::Request::new(request.method, url);
    *outbound.headers_mut() = headers;
    *outbound.body_mut() = match request.body {
        ProxyBody::Json(json) => Some(reqwest::Body::from(serde_json::to_vec(&json)?)),
        ProxyBody::Raw(bytes) => Some(reqwest::Body::from(bytes)),
        ProxyBody::Stream(body) => Some(reqwest::Body::wrap_stream(body.into_data_stream())),
        ProxyBody::Empty => None,
    };

    Ok(OutboundRequest { request: outbound })
}
