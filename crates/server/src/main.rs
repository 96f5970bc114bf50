use anyhow::Result;
use clap::Parser;
use flowkeel_core::{HandlerRegistry, Worker};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

mod api;
mod config;

use config::{AppState, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "flowkeel")]
#[command(about = "DAG workflow engine with durable, queue-driven task execution", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "FLOWKEEL_CONFIG", default_value = "flowkeel.toml")]
    config: PathBuf,

    /// Data directory for the state store
    #[arg(short, long, env = "FLOWKEEL_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Port to listen on
    #[arg(short, long, env = "FLOWKEEL_PORT", default_value = "8080")]
    port: u16,

    /// Host to bind to
    #[arg(long, env = "FLOWKEEL_HOST", default_value = "127.0.0.1")]
    host: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowkeel=info,flowkeel_core=info,tower_http=debug".into()),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    tracing::info!("Starting Flowkeel");
    tracing::info!("Data directory: {}", args.data_dir.display());

    let config = ServerConfig::load(&args.config, args.data_dir)?;
    let state = AppState::new(&config)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        signal.cancel();
    });

    // Embedded workers only know the built-in handlers. Custom handlers need a
    // binary that embeds flowkeel-core and registers them itself.
    let handlers = Arc::new(HandlerRegistry::with_builtins());
    let mut workers = JoinSet::new();
    for worker_config in config.worker.worker_configs() {
        let worker = Worker::new(state.engine.clone(), handlers.clone(), worker_config);
        let token = shutdown.clone();
        workers.spawn(async move { worker.run(token).await });
    }

    let addr = format!("{}:{}", args.host, args.port);
    tracing::info!("Starting API server on {}", addr);
    let served = api::serve(&addr, state, shutdown.clone()).await;

    // Stop workers too if the server exited on its own
    shutdown.cancel();
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(stats)) => tracing::debug!("Worker exited: {:?}", stats),
            Ok(Err(e)) => tracing::error!("Worker failed: {:#}", e),
            Err(e) => tracing::error!("Worker task aborted: {}", e),
        }
    }

    served
}
