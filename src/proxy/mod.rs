//! The forwarding engine.
//!
//! One inbound request flows through these stages in order:
//! - [`target`] resolves the upstream URL
//! - [`policy`] may answer locally with a rejection
//! - [`translate`] builds the outbound request
//! - [`forwarder`] executes it under a deadline
//! - [`relay`] shapes the caller-facing response
//! - [`tap`] and [`usage`] observe the body for telemetry

pub mod forwarder;
pub mod policy;
pub mod relay;
pub mod tap;
pub mod target;
pub mod translate;
pub mod usage;

use bytes::Bytes;
use futures::stream::BoxStream;

/// Response body as a single-consumption stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

pub use forwarder::{build_http_client, Forwarder, UpstreamResponse};
pub use policy::{rejection_response, ModelPolicy, PolicyDecision};
pub use relay::{relay_headers, relay_response};
pub use tap::{tap, TapBranch};
pub use target::UpstreamTarget;
pub use translate::{build_outbound, is_write_method, OutboundRequest, ProxyBody, ProxyRequest};
pub use usage::{run_usage_accumulator, UsageAccumulator, UsageRecord};
