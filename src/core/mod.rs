//! Core functionality for the chat proxy server.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling
//! - Logging context and metrics
//! - HTTP middleware
//! - Telemetry sink contract

pub mod cancel;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod telemetry;

// Re-export commonly used types
pub use cancel::StreamCancelHandle;
pub use config::{AppConfig, PolicyConfig, ServerConfig, TelemetryConfig, UpstreamConfig};
pub use error::{AppError, Result, TelemetryError};
pub use logging::{generate_request_id, get_request_id, REQUEST_ID};
pub use metrics::{get_metrics, init_metrics, Metrics};
pub use middleware::{request_id_middleware, MetricsMiddleware};
pub use telemetry::{AxiomSink, TelemetrySink};
