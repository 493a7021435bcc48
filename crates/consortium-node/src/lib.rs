//! Consortium Node - round coordination for consortium stores
//!
//! Ties the store and the aggregation core together:
//!
//! - **Registry**: one store handle per consortium, created on first use
//! - **Watcher**: typed events from a store's live change feed
//! - **Coordinator**: per-consortium locked pipelines that refresh
//!   contributors and recompute completed rounds
//! - **Lock**: keyed async mutexes, one per store name
//!
//! # Example
//!
//! ```no_run
//! use consortium_node::{ConsortiumNode, NodeConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_env()?;
//!     let node = ConsortiumNode::new(config).await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod lock;
pub mod node;
pub mod registry;
pub mod watcher;

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str =
    "consortium_node=info,consortium_store=info,consortium_aggregate=info";

pub use config::{Backend, NodeConfig};
pub use coordinator::{Recomputation, RoundCoordinator, RoundEvent};
pub use error::{Error, Result};
pub use lock::{KeyedGuard, KeyedLock};
pub use node::ConsortiumNode;
pub use registry::{slugify, ConsortiumHandle, ConsortiumRegistry};
pub use watcher::{ChangeWatcher, WatchEvent, WatcherState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_filter_names_every_crate() {
        let targets: Vec<_> = DEFAULT_LOG_FILTER
            .split(',')
            .filter_map(|directive| directive.split('=').next())
            .collect();
        assert_eq!(
            targets,
            vec!["consortium_node", "consortium_store", "consortium_aggregate"]
        );
        assert!(tracing_subscriber::EnvFilter::try_new(DEFAULT_LOG_FILTER).is_ok());
    }
}
