//! hello-responder: a minimal concurrent TCP responder
//!
//! Every accepted connection gets its own task, which reads once (at most
//! 1 KiB), logs how many bytes arrived, answers with
//! `HTTP/1.1 200 OK\r\n\r\nHello, World\r\n` and closes.
//!
//! Features:
//! - Per-connection read and write deadlines
//! - Transient accept errors are retried, fatal ones stop the server
//! - Connection cap and graceful shutdown on SIGINT/SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod handler;
mod listener;
mod server;
mod shutdown;

use config::Config;
use server::{Server, ServerError};
use shutdown::Shutdown;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let workers = config.workers.filter(|&n| n > 0).unwrap_or_else(num_cpus);

    info!(
        listen = %config.listen,
        workers,
        max_connections = config.max_connections,
        read_timeout = ?config.read_timeout,
        write_timeout = ?config.write_timeout,
        "Starting hello-responder"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    if let Err(e) = runtime.block_on(run(config)) {
        error!(error = %e, "Server stopped");
        drop(runtime);
        std::process::exit(1);
    }

    info!("Server stopped");
    Ok(())
}

/// Serve until a shutdown signal arrives or the listener fails.
async fn run(config: Config) -> Result<(), ServerError> {
    let shutdown = Shutdown::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match shutdown::wait_for_signal().await {
            Ok(signal) => {
                info!(signal, "Shutdown signal received");
                trigger.trigger();
            }
            Err(e) => error!(error = %e, "Failed to install signal handlers"),
        }
    });

    Server::new(config).run(shutdown).await
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
