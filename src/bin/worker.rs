//! Worker process: runs the echo operator function for its slot in the pool
//!
//! Usage: dagwire-worker <cluster.yaml> <index>

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;

use dagwire::transport::serve;
use dagwire::{ClusterConfig, EchoFunction, TcpTransport, WorkerRuntime};

#[tokio::main]
async fn main() -> Result<()> {
    dagwire::init_tracing();

    let mut args = std::env::args().skip(1);
    let usage = "usage: dagwire-worker <cluster config> <worker index>";
    let path = args.next().context(usage)?;
    let index: usize = args
        .next()
        .context(usage)?
        .parse()
        .context("worker index must be a non-negative integer")?;

    let config = ClusterConfig::from_file(&path)
        .with_context(|| format!("Failed to load cluster config from {}", path))?;
    let worker_config = config.worker_config(index)?;
    let address = worker_config.address.clone();

    let listener = TcpListener::bind(address.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    let transport = Arc::new(TcpTransport::from_config(&config));
    let handle = WorkerRuntime::spawn(worker_config, Arc::new(EchoFunction), transport);
    tracing::info!("worker {} ready, controller at {}", address, config.controller);

    tokio::select! {
        result = serve(listener, Arc::new(handle.clone()), config.max_frame_bytes) => {
            result.context("worker listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down worker {}", address);
            handle.shutdown().await;
        }
    }
    Ok(())
}
