//! Chat Proxy Server - Main entry point
//!
//! This binary creates and runs the HTTP server with all configured routes and middleware.
//! Configuration is read from the environment (and an optional `.env` file).

use anyhow::Result;
use chat_proxy_rust::{
    api::{build_router, ProxyState},
    core::{
        init_metrics,
        logging::{build_env_filter, LocalTime},
        AppConfig, AxiomSink, TelemetrySink,
    },
    proxy::build_http_client,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How long shutdown waits for in-flight usage records.
const BACKGROUND_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(worker_threads) = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
    {
        println!("Tokio runtime: using {} worker threads", worker_threads);
        builder.worker_threads(worker_threads);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    // Check if NO_COLOR environment variable is set (for file logging without ANSI codes)
    let no_color = std::env::var("NO_COLOR").is_ok();
    let filter = build_env_filter(std::env::var("RUST_LOG").ok().as_deref());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTime)
                .with_ansi(!no_color),
        )
        .init();

    init_metrics();

    let config = AppConfig::from_env();
    let http_client = build_http_client(&config.upstream)?;

    let axiom = if config.telemetry.enabled() {
        Some(AxiomSink::spawn(&config.telemetry, reqwest::Client::new()))
    } else {
        tracing::info!("AXIOM_TOKEN/AXIOM_ORG_ID not set, usage telemetry disabled");
        None
    };
    let telemetry = axiom
        .clone()
        .map(|sink| Arc::new(sink) as Arc<dyn TelemetrySink>);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let prefix = config.upstream.proxy_prefix.clone();
    let policy_marker = config.policy.disabled_model.clone();

    let state = ProxyState::new(config, http_client, telemetry);
    let background = state.background.clone();
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    tracing::info!("Starting Chat Proxy on {}", addr);
    tracing::info!("Proxy prefix: {}", prefix);
    if let Some(marker) = policy_marker {
        tracing::info!("Model policy gate active for '{}'", marker);
    }
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await?;

    background.close();
    if tokio::time::timeout(BACKGROUND_DRAIN_TIMEOUT, background.wait())
        .await
        .is_err()
    {
        tracing::warn!(
            pending = background.len(),
            "Timed out waiting for usage accumulators"
        );
    }
    if let Some(sink) = axiom {
        sink.shutdown().await;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
