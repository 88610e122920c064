//! Chat Proxy Server - a transparent forwarding proxy for the OpenAI chat API
//!
//! Requests under a routing prefix are retargeted to the upstream API and
//! relayed back unchanged, including streamed event-stream bodies. Features:
//!
//! - **Model Policy Gate**: optionally refuse a disallowed model before any upstream call
//! - **Deadline-Bounded Forwarding**: upstream calls abort after a fixed deadline
//! - **Usage Telemetry**: streamed responses are tapped and summarized into one usage
//!   record per request, delivered to Axiom without delaying the caller
//! - **Metrics & Monitoring**: Prometheus metrics for observability
//!
//! # Architecture
//!
//! - [`core`]: Core functionality (config, errors, logging, metrics, middleware, telemetry sink)
//! - [`proxy`]: The forwarding engine (target, policy, translation, forwarder, relay, tap, usage)
//! - [`api`]: HTTP handlers and router assembly
//!
//! # Configuration
//!
//! All settings come from environment variables and have defaults:
//! - `BASE_URL`: Upstream host or URL (default: api.openai.com)
//! - `PROTOCOL`: Scheme for a scheme-less `BASE_URL` (default: https)
//! - `OPENAI_ORG_ID`: Organization id sent upstream
//! - `DISABLE_GPT4`: Refuse models containing `gpt-4`
//! - `AXIOM_TOKEN` / `AXIOM_ORG_ID`: Enable usage telemetry
//! - `PORT`: Server port (default: 3000)

pub mod api;
pub mod core;
pub mod proxy;

// Re-export commonly used types for convenience
pub use api::{build_router, ProxyState};
pub use core::{AppConfig, AppError, AxiomSink, Result, TelemetrySink};
