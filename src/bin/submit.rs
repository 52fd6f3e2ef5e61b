//! Submit a workflow definition to a running controller
//!
//! Usage: dagwire-submit <cluster.yaml> <workflow.yaml>

use anyhow::{bail, Context, Result};

use dagwire::coord::SubmitStatus;
use dagwire::{ClusterConfig, ControllerClient, WorkflowDefinition};

#[tokio::main]
async fn main() -> Result<()> {
    dagwire::init_tracing();

    let mut args = std::env::args().skip(1);
    let usage = "usage: dagwire-submit <cluster config> <workflow file>";
    let config_path = args.next().context(usage)?;
    let workflow_path = args.next().context(usage)?;

    let config = ClusterConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load cluster config from {}", config_path))?;
    let definition = WorkflowDefinition::from_file(&workflow_path)
        .with_context(|| format!("Failed to load workflow from {}", workflow_path))?;

    let client = ControllerClient::from_config(&config);
    match client.submit(definition).await? {
        SubmitStatus::Accepted(run_id) => {
            println!("{}", run_id);
            Ok(())
        }
        SubmitStatus::Rejected(reason) => bail!("workflow rejected: {}", reason),
    }
}
