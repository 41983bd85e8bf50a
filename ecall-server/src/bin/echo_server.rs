//! Standalone echo service.
//!
//! Usage: `ecall-echo-server [config.json]`. Without a config file the server
//! listens on 0.0.0.0:8001. Log verbosity follows `RUST_LOG`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ecall_common::error::RpcError;
use ecall_server::{CallMonitor, LogSink, Pipeline, Router, Server, ServerConfig};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

fn load_config() -> anyhow::Result<ServerConfig> {
    let Some(path) = std::env::args().nth(1) else {
        return Ok(ServerConfig::default());
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("read config {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parse config {path}"))
}

fn echo_router(service: &str) -> Router {
    Router::new(service)
        .route("echo", |_ctx, body: Value| async move { Ok::<_, RpcError>(body) })
        .route_raw("echo_raw", |_ctx, body| async move { Ok::<_, RpcError>(body) })
        .route("sleep", |_ctx, millis: u64| async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, RpcError>(millis)
        })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let monitor = CallMonitor::new();
    let _reporter = monitor.spawn_reporter(ecall_server::metrics::DEFAULT_REPORT_INTERVAL, Arc::new(LogSink));
    let pipeline = Pipeline::builder(echo_router(&config.service)).with(monitor).build();

    let server = Server::bind(config, pipeline).await.context("bind listener")?;
    server
        .serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serve")?;
    Ok(())
}
