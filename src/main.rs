#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use mirage::config::MirageConfig;
use mirage::metrics::Metrics;
use mirage::{controller, detector, gateway, runtime};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mirage", about = "Active deception control plane for Kubernetes web workloads")]
struct Cli {
    /// Path to the shared config file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the routing gateway (ingress proxy + control API)
    Gateway,
    /// Run the log-stream detector
    Detector,
    /// Run the decoy orchestrator (reconciler + alert sink)
    Controller,
    /// Print the AttackResponse CRD manifest and exit
    Crd,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Crd = cli.command {
        println!("{}", controller::crd_manifest()?);
        return Ok(());
    }

    init_tracing();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(runtime::worker_threads())
        .enable_all()
        .build()?;

    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let config = MirageConfig::load(&cli.config)?;
    let metrics = Metrics::install();

    let shutdown = Arc::new(Notify::new());
    tokio::spawn(wait_for_signals(shutdown.clone()));

    match cli.command {
        Command::Gateway => gateway::run(&config.gateway, metrics, shutdown).await,
        Command::Detector => detector::run(&config.detector, shutdown).await,
        Command::Controller => controller::run(&config.controller, metrics, shutdown).await,
        Command::Crd => unreachable!("handled before runtime start"),
    }
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_signals(shutdown: Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(action = "signal", "received SIGINT, shutting down"),
        _ = terminate => tracing::info!(action = "signal", "received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
