//! Response relay: upstream status and headers onto the caller's response.

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};

/// Header telling reverse proxies (nginx) not to buffer the body.
pub const X_ACCEL_BUFFERING: HeaderName = HeaderName::from_static("x-accel-buffering");

/// Connection-scoped headers that describe the upstream hop, not the body.
const HOP_BY_HOP: [HeaderName; 6] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
    header::PROXY_AUTHENTICATE,
];

/// Copy upstream headers for the caller.
///
/// `www-authenticate` is dropped so browsers never show a credential prompt
/// for an upstream 401.
pub fn relay_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 1);
    for (name, value) in upstream {
        if name == header::WWW_AUTHENTICATE || HOP_BY_HOP.contains(name) {
            continue;
        }
        if name.as_str() == "keep-alive" {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(X_ACCEL_BUFFERING, HeaderValue::from_static("no"));
    headers
}

/// Build the caller-facing response around `body`.
pub fn relay_response(status: StatusCode, upstream_headers: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = relay_headers(upstream_headers);
    response
}
