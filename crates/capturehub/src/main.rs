//! capturehub - capture coordination daemon
//!
//! Binds the producer endpoint, serves producer connections, and takes
//! operator commands on stdin (`start [pid] [rate]`, `stop`, `status`, `quit`).
//! SIGINT, SIGTERM or `quit` shut it down.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use captureconf::CaptureConfig;
use captureproto::Endpoint;
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn};

use capturehub::{run_operator_loop, CaptureLifecycle, ProducerServer};

mod telemetry;

#[derive(Parser)]
#[command(name = "capturehub")]
#[command(about = "Coordinates capture start/stop across event producers")]
#[command(version)]
struct Cli {
    /// Config file (replaces ./capturebus.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Producer endpoint, e.g. unix:///tmp/capturebus.sock or tcp://127.0.0.1:5590
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Longest a stop waits for producers to flush, in milliseconds
    #[arg(long)]
    max_wait_ms: Option<u64>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = CaptureConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(endpoint) = cli.endpoint {
        config.bind.endpoint = endpoint;
    }
    if let Some(max_wait_ms) = cli.max_wait_ms {
        config.service.max_wait_for_all_events_sent_ms = max_wait_ms;
    }

    if cli.print_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    telemetry::init(&config.telemetry.log_level)?;
    for file in &sources.files {
        info!("loaded config from {}", file.display());
    }
    for var in &sources.env_overrides {
        info!("config override from ${}", var);
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    let result = runtime.block_on(run(config));
    // The stdin reader is a blocking read that cannot be cancelled.
    runtime.shutdown_timeout(Duration::from_millis(250));
    result
}

async fn run(config: CaptureConfig) -> Result<()> {
    info!("capturehub {} starting", env!("CARGO_PKG_VERSION"));

    let endpoint: Endpoint = config
        .bind
        .endpoint
        .parse()
        .with_context(|| format!("Invalid bind endpoint '{}'", config.bind.endpoint))?;

    let lifecycle = Arc::new(CaptureLifecycle::new(&config.service));
    info!(
        "stop waits up to {:?} for producers",
        lifecycle.max_wait_for_all_events_sent()
    );

    let server = ProducerServer::bind(&endpoint, lifecycle.clone(), config.bind.max_frame_bytes).await?;
    let server_task = tokio::spawn(server.run());

    let operator_task = tokio::spawn(run_operator_loop(
        lifecycle.clone(),
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
    ));

    let shutdown = lifecycle.shutdown_token();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {}
    }
    lifecycle.request_shutdown();

    server_task.await.context("Producer server task panicked")??;
    if operator_task.is_finished() {
        if let Ok(Err(e)) = operator_task.await {
            warn!("operator console failed: {:#}", e);
        }
    } else {
        operator_task.abort();
    }

    info!("capturehub shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
