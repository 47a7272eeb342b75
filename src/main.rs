//! Bedrock Proxy - Main entry point
//!
//! Loads configuration, builds the Bedrock backend and serves the
//! OpenAI-compatible API.

use anyhow::Result;
use bedrock_proxy::{
    api::{create_router, AppState},
    core::{init_metrics, logging::init_tracing, AppConfig},
    services::BedrockBackend,
};
use std::net::SocketAddr;
use std::sync::Arc;

fn main() -> Result<()> {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();

    let config = match std::env::var("CONFIG_FILE") {
        Ok(path) if !path.is_empty() => AppConfig::load(&path)?,
        _ => AppConfig::from_env()?,
    };

    let worker_threads = if config.max_workers > 0 {
        config.max_workers
    } else {
        detect_cpu_limit()
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
    };

    println!("Tokio runtime: using {} worker threads", worker_threads);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(async_main(config))
}

async fn async_main(config: AppConfig) -> Result<()> {
    init_tracing();
    init_metrics();

    let backend = Arc::new(BedrockBackend::new(&config.backend)?);

    tracing::info!(
        region = %config.backend.region,
        auth_mode = ?config.auth.mode,
        model_prefix = %config.model_prefix,
        request_timeout_secs = config.backend.request_timeout_secs,
        stream_read_timeout_secs = config.backend.stream_read_timeout_secs,
        "Bedrock backend configured"
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let state = Arc::new(AppState::new(config, backend));
    let app = create_router(state);

    tracing::info!("Starting Bedrock proxy on {}", addr);
    tracing::info!("OpenAI API: /v1/chat/completions, /v1/models");
    tracing::info!("Metrics endpoint: /metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    // cgroup v2: "<quota> <period>" or "max <period>"
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some((quota, period)) = max.trim().split_once(' ') {
            if let (Ok(quota), Ok(period)) = (quota.parse::<i64>(), period.parse::<i64>()) {
                return cores_from_quota(quota, period);
            }
        }
    }

    let quota = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;
    let period = std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
        .ok()?
        .trim()
        .parse::<i64>()
        .ok()?;

    cores_from_quota(quota, period)
}

fn cores_from_quota(quota: i64, period: i64) -> Option<usize> {
    if quota <= 0 || period <= 0 {
        return None;
    }
    Some(((quota as f64 / period as f64).ceil() as usize).max(1))
}
