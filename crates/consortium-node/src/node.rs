//! Consortium node daemon.

use consortium_aggregate::Consortium;
use consortium_store::{MemoryFactory, RocksFactory, StoreFactory};
use std::sync::Arc;

use crate::config::{Backend, NodeConfig};
use crate::error::Result;
use crate::registry::ConsortiumRegistry;

/// A node watching a set of consortium stores.
pub struct ConsortiumNode {
    registry: Arc<ConsortiumRegistry>,
    config: NodeConfig,
}

impl ConsortiumNode {
    /// Create a new node.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let factory: Arc<dyn StoreFactory> = match config.backend {
            Backend::RocksDb => {
                // Ensure data directory exists
                std::fs::create_dir_all(&config.data_dir)?;
                Arc::new(RocksFactory::new(&config.data_dir))
            }
            Backend::Memory => Arc::new(MemoryFactory::new()),
        };

        let registry = ConsortiumRegistry::new(factory)
            .with_prefix(config.store_prefix.clone())
            .with_seed(config.seed.clone())
            .with_policy(config.policy.clone());

        Ok(Self {
            registry: Arc::new(registry),
            config,
        })
    }

    /// Get the registry.
    pub fn registry(&self) -> Arc<ConsortiumRegistry> {
        Arc::clone(&self.registry)
    }

    /// Open every configured consortium.
    pub async fn start(&self) -> Result<()> {
        for id in &self.config.consortium_ids {
            let consortium = Consortium::new(id.clone(), self.config.client_count);
            self.registry.provision(&consortium).await?;
        }
        Ok(())
    }

    /// Run until ctrl-c.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Consortium node starting");
        tracing::info!("  Backend: {:?}", self.config.backend);
        tracing::info!("  Data: {:?}", self.config.data_dir);
        tracing::info!("  Consortia: {:?}", self.config.consortium_ids);

        self.start().await?;
        tracing::info!("Watching {} consortia", self.registry.len());

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutting down");
        self.registry.shutdown();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_provisions_configured_consortia() {
        let config = NodeConfig {
            backend: Backend::Memory,
            consortium_ids: vec!["Study A".into(), "study-b".into()],
            client_count: 2,
            ..NodeConfig::default()
        };
        let node = ConsortiumNode::new(config).await.unwrap();
        node.start().await.unwrap();

        let registry = node.registry();
        assert_eq!(registry.len(), 2);
        let handle = registry.get("study a").unwrap();
        assert_eq!(handle.name(), "consortium-study-a");
        registry.shutdown();
    }

    #[tokio::test]
    async fn rocks_backend_creates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            data_dir: dir.path().join("stores"),
            consortium_ids: vec!["study".into()],
            ..NodeConfig::default()
        };
        let node = ConsortiumNode::new(config).await.unwrap();
        node.start().await.unwrap();
        assert!(dir.path().join("stores").join("consortium-study").exists());
        node.registry().shutdown();
    }
}
