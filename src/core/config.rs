//! Configuration management for the chat proxy server.
//!
//! Configuration is read from environment variables. Every setting has a
//! documented default, so a missing or malformed value never prevents the
//! server from starting.

use serde::{Deserialize, Serialize};

/// Default upstream host when `BASE_URL` is not set.
pub const OPENAI_URL: &str = "api.openai.com";

/// Default scheme prepended to a scheme-less `BASE_URL`.
pub const DEFAULT_PROTOCOL: &str = "https";

/// Routing prefix stripped from inbound paths before forwarding.
pub const DEFAULT_PROXY_PREFIX: &str = "/api/openai/";

/// Deadline for an upstream call: 10 minutes.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10 * 60;

/// Model marker rejected when the policy gate is switched on.
pub const DEFAULT_DISABLED_MODEL: &str = "gpt-4";

/// Dataset that usage records are ingested into when `AXIOM_DATASET` is unset.
pub const DEFAULT_DATASET: &str = "gpt";

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration (host, port)
    #[serde(default)]
    pub server: ServerConfig,

    /// Where and how requests are forwarded
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Model policy gate
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Usage telemetry sink
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Server-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest JSON request body the proxy will buffer and parse.
    /// Unlimited when unset.
    #[serde(default)]
    pub max_body_bytes: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: None,
        }
    }
}

/// Upstream target configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream host or full URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Scheme used when `base_url` carries none
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Optional `OpenAI-Organization` header value
    #[serde(default)]
    pub org_id: Option<String>,

    /// Inbound routing prefix removed before forwarding
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,

    /// Deadline in seconds for the upstream call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Whether to verify upstream TLS certificates
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            protocol: default_protocol(),
            org_id: None,
            proxy_prefix: default_proxy_prefix(),
            request_timeout_secs: default_request_timeout(),
            verify_ssl: default_verify_ssl(),
        }
    }
}

/// Model policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Substring that makes a requested model name disallowed. `None` turns
    /// the gate off.
    #[serde(default)]
    pub disabled_model: Option<String>,
}

/// Usage telemetry (Axiom) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Axiom API token
    #[serde(default)]
    pub token: Option<String>,

    /// Axiom organization id
    #[serde(default)]
    pub org_id: Option<String>,

    /// Dataset records are ingested into
    #[serde(default = "default_dataset")]
    pub dataset: String,

    /// Axiom API base URL
    #[serde(default = "default_axiom_url")]
    pub url: String,

    /// Background flush interval in seconds
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            token: None,
            org_id: None,
            dataset: default_dataset(),
            url: default_axiom_url(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

impl TelemetryConfig {
    /// Telemetry runs only when both credentials are present.
    pub fn enabled(&self) -> bool {
        is_set(&self.token) && is_set(&self.org_id)
    }
}

fn is_set(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.is_empty())
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_base_url() -> String {
    OPENAI_URL.to_string()
}

fn default_protocol() -> String {
    DEFAULT_PROTOCOL.to_string()
}

fn default_proxy_prefix() -> String {
    DEFAULT_PROXY_PREFIX.to_string()
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_verify_ssl() -> bool {
    true
}

fn default_dataset() -> String {
    DEFAULT_DATASET.to_string()
}

fn default_axiom_url() -> String {
    "https://api.axiom.co".to_string()
}

fn default_flush_interval() -> u64 {
    5
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use chat_proxy_rust::core::config::AppConfig;
    ///
    /// let config = AppConfig::from_env();
    /// println!("forwarding to {}", config.upstream.base_url);
    /// ```
    pub fn from_env() -> Self {
        let mut config = AppConfig::default();

        if let Some(host) = env_string("HOST") {
            config.server.host = host;
        }
        if let Some(port) = env_parse::<u16>("PORT") {
            config.server.port = port;
        }
        if let Some(limit) = env_parse::<usize>("MAX_BODY_BYTES") {
            config.server.max_body_bytes = Some(limit);
        }

        if let Some(base_url) = env_string("BASE_URL") {
            config.upstream.base_url = base_url;
        }
        if let Some(protocol) = env_string("PROTOCOL") {
            config.upstream.protocol = protocol;
        }
        config.upstream.org_id = env_string("OPENAI_ORG_ID");
        if let Some(prefix) = env_string("PROXY_PREFIX") {
            config.upstream.proxy_prefix = prefix;
        }
        if let Some(timeout) = env_parse::<u64>("REQUEST_TIMEOUT_SECS") {
            config.upstream.request_timeout_secs = timeout;
        }
        if let Some(verify_ssl) = env_string("VERIFY_SSL") {
            config.upstream.verify_ssl = str_to_bool(&verify_ssl);
        }

        if env_string("DISABLE_GPT4").is_some_and(|v| flag_enabled(&v)) {
            let marker = env_string("DISABLED_MODEL")
                .unwrap_or_else(|| DEFAULT_DISABLED_MODEL.to_string());
            config.policy.disabled_model = Some(marker);
        }

        config.telemetry.token = env_string("AXIOM_TOKEN");
        config.telemetry.org_id = env_string("AXIOM_ORG_ID");
        if let Some(dataset) = env_string("AXIOM_DATASET") {
            config.telemetry.dataset = dataset;
        }
        if let Some(url) = env_string("AXIOM_URL") {
            config.telemetry.url = url;
        }
        if let Some(interval) = env_parse::<u64>("AXIOM_FLUSH_INTERVAL") {
            config.telemetry.flush_interval_secs = interval;
        }

        config
    }
}

/// Read a non-empty environment variable.
fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_string(name)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring malformed value, using default");
            None
        }
    }
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// A feature flag is on for any non-empty value except an explicit "off".
fn flag_enabled(value: &str) -> bool {
    !matches!(
        value.trim().to_lowercase().as_str(),
        "" | "0" | "false" | "no" | "off"
    )
}
