#![doc = include_str!("../README.md")]

mod agent;

use agent::config::{AgentConfig, Backend, CliArgs};
use agent::runner::run;
use agent::telemetry::init_telemetry;
use clap::Parser;
use ferroid_lease::{EtcdConnector, MemoryCluster};
use tokio::signal;
use tokio_util::sync::CancellationToken;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = AgentConfig::try_from(args)?;

    init_telemetry()?;
    log_startup_info(&config);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    match config.backend {
        Backend::Etcd => run(EtcdConnector::new(), config, shutdown).await?,
        Backend::Memory => run(MemoryCluster::new().connector(), config, shutdown).await?,
    };

    tracing::info!("Agent shut down successfully");
    Ok(())
}

fn log_startup_info(config: &AgentConfig) {
    if cfg!(debug_assertions) {
        tracing::info!("Starting lease agent with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting lease agent against {} ({:?}) for {} slots under {}",
            config.address,
            config.backend,
            config.pool_size,
            config.base_path
        );
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C signal"),
        () = terminate => tracing::info!("Received SIGTERM signal"),
    }

    tracing::info!("Shutdown signal received, abandoning held claims...");
    shutdown.cancel();
}
