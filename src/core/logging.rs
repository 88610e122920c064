//! Logging utilities with request context support.
//!
//! Every proxied request runs inside a task-local request id so that log
//! lines emitted anywhere on the request path can be correlated.

use chrono::Local;

tokio::task_local! {
    /// Task-local storage for the current request ID.
    ///
    /// This allows logs to include a unique request ID for tracking all logs
    /// related to a single request.
    pub static REQUEST_ID: String;
}

/// Get the current request ID from context, if set.
///
/// Returns an empty string if no request ID is set.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(|id| id.clone()).unwrap_or_default()
}

/// Generate a new unique request ID using UUID v4.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
pub struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Build the subscriber filter.
///
/// `RUST_LOG` (or the crate default) is always extended with noise
/// suppression for the HTTP stack, otherwise a bare `RUST_LOG=trace` floods
/// the output with hyper internals.
pub fn build_env_filter(rust_log: Option<&str>) -> tracing_subscriber::EnvFilter {
    let base_filter = rust_log.unwrap_or("info,chat_proxy_rust=debug");
    let filter_str = format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn",
        base_filter
    );
    tracing_subscriber::EnvFilter::new(filter_str)
}
