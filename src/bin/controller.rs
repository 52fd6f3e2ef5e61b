//! Controller process: listens on the configured controller address
//!
//! Usage: dagwire-controller <cluster.yaml>

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;

use dagwire::transport::serve;
use dagwire::{ClusterConfig, Controller, ControllerService, TcpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    dagwire::init_tracing();

    let path = std::env::args()
        .nth(1)
        .context("usage: dagwire-controller <cluster config>")?;
    let config = ClusterConfig::from_file(&path)
        .with_context(|| format!("Failed to load cluster config from {}", path))?;

    tracing::info!(
        "controller on {} with {} workers: {:?}",
        config.controller,
        config.workers.len(),
        config.workers
    );

    let transport = Arc::new(TcpTransport::from_config(&config));
    let listener = TcpListener::bind(config.controller.as_str())
        .await
        .with_context(|| format!("Failed to bind {}", config.controller))?;
    let max_frame_bytes = config.max_frame_bytes;
    let controller = Arc::new(Controller::new(config, transport));
    let service = Arc::new(ControllerService::new(controller));

    tokio::select! {
        result = serve(listener, service, max_frame_bytes) => {
            result.context("controller listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down controller");
        }
    }
    Ok(())
}
