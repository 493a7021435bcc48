//! Consortium Node binary
//!
//! Watches consortium stores and aggregates completed rounds.

use consortium_node::{ConsortiumNode, NodeConfig, DEFAULT_LOG_FILTER};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Consortium Node");

    let config = NodeConfig::from_env()?;

    let node = ConsortiumNode::new(config).await?;
    node.run().await?;

    Ok(())
}
