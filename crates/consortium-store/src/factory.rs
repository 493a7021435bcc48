//! Store creation by name.

use crate::error::Result;
use crate::memory::MemoryStore;
use crate::rocks::RocksStore;
use crate::DocumentStore;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

/// Creates (or opens) the store backing a consortium.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    /// Create or open the store called `name`.
    async fn create(&self, name: &str) -> Result<Arc<dyn DocumentStore>>;
}

/// Factory for in-memory stores.
#[derive(Debug, Clone, Default)]
pub struct MemoryFactory {
    secured: bool,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce security-aware stores.
    pub fn secured() -> Self {
        Self { secured: true }
    }
}

#[async_trait]
impl StoreFactory for MemoryFactory {
    async fn create(&self, name: &str) -> Result<Arc<dyn DocumentStore>> {
        let store = if self.secured {
            MemoryStore::secured(name)
        } else {
            MemoryStore::new(name)
        };
        Ok(Arc::new(store))
    }
}

/// Factory for RocksDB stores, one directory per store under `root`.
#[derive(Debug, Clone)]
pub struct RocksFactory {
    root: PathBuf,
}

impl RocksFactory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StoreFactory for RocksFactory {
    async fn create(&self, name: &str) -> Result<Arc<dyn DocumentStore>> {
        std::fs::create_dir_all(&self.root)?;
        let store = RocksStore::open(name, self.root.join(name))?;
        tracing::debug!(store = name, path = ?self.root.join(name), "opened rocksdb store");
        Ok(Arc::new(store))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use tempfile::tempdir;

    #[tokio::test]
    async fn memory_factory_names_stores() {
        let store = MemoryFactory::new().create("consortium-a").await.unwrap();
        assert_eq!(store.name(), "consortium-a");
        assert!(!store.supports_security());
        assert!(MemoryFactory::secured()
            .create("b")
            .await
            .unwrap()
            .supports_security());
    }

    #[tokio::test]
    async fn rocks_factory_creates_directory_per_store() {
        let dir = tempdir().unwrap();
        let factory = RocksFactory::new(dir.path().join("stores"));

        let store = factory.create("consortium-a").await.unwrap();
        store.save(Document::new("x")).await.unwrap();

        assert!(dir.path().join("stores").join("consortium-a").exists());
        assert!(store.supports_security());
    }
}
