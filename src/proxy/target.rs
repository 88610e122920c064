//! Upstream target resolution.
//!
//! Turns the configured base host and the inbound path into the absolute URL
//! the request is forwarded to. Pure computation, no network access.

use crate::core::config::UpstreamConfig;
use crate::core::{AppError, Result};

/// Where a single request is forwarded to.
///
/// `host` never ends with a slash and `scheme` is always explicit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub scheme: String,
    /// Authority plus any base path carried by the configured URL
    pub host: String,
    /// Inbound path and query with the proxy prefix removed, no leading slash
    pub path: String,
}

impl UpstreamTarget {
    /// Resolve the target for an inbound `path?query`.
    pub fn resolve(config: &UpstreamConfig, path_and_query: &str) -> Self {
        let base = normalize_base_url(&config.base_url, &config.protocol);
        let (scheme, host) = match base.split_once("://") {
            Some((scheme, host)) => (scheme.to_string(), host.to_string()),
            None => (config.protocol.clone(), base),
        };

        let remainder = strip_proxy_prefix(path_and_query, &config.proxy_prefix);
        let path = remainder.strip_prefix('/').unwrap_or(&remainder).to_string();

        Self { scheme, host, path }
    }

    /// `scheme://host`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    /// Absolute URL to invoke.
    pub fn url(&self) -> String {
        format!("{}/{}", self.base_url(), self.path)
    }

    /// Parsed form of [`UpstreamTarget::url`].
    pub fn to_url(&self) -> Result<reqwest::Url> {
        let url = self.url();
        reqwest::Url::parse(&url).map_err(|e| AppError::InvalidTarget(format!("{url}: {e}")))
    }
}

/// Prepend `protocol` to a scheme-less base and strip one trailing slash.
pub fn normalize_base_url(base_url: &str, protocol: &str) -> String {
    let base_url = base_url.trim();
    let mut normalized = if has_scheme(base_url) {
        base_url.to_string()
    } else {
        let protocol = protocol.trim().trim_end_matches("://").trim_end_matches(':');
        let protocol = if protocol.is_empty() {
            crate::core::config::DEFAULT_PROTOCOL
        } else {
            protocol
        };
        format!("{}://{}", protocol, base_url)
    };

    if normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// True when `value` starts with `scheme://`.
fn has_scheme(value: &str) -> bool {
    let Some((scheme, _)) = value.split_once("://") else {
        return false;
    };
    let mut chars = scheme.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Remove the first occurrence of `prefix` from `path_and_query`.
pub fn strip_proxy_prefix(path_and_query: &str, prefix: &str) -> String {
    if prefix.is_empty() {
        return path_and_query.to_string();
    }
    path_and_query.replacen(prefix, "", 1)
}
