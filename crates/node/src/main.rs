use tokio::io::BufReader;
use tracing::error;

use stockflow_infra::EngineConfig;
use stockflow_node::{Exit, Node, forward_commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockflow_observability::init();

    let config = EngineConfig::from_env()?;
    let node = Node::boot(config).await?;

    let operations = node.operations().clone();
    let inbox = node.inbox().clone();
    tokio::spawn(forward_commands(BufReader::new(tokio::io::stdin()), operations, inbox));

    match node.run().await? {
        Exit::Interrupted => Ok(()),
        Exit::TenantChanged(changed) => {
            error!(error = %changed, "tenant changed; exiting for restart");
            std::process::exit(1);
        }
    }
}
