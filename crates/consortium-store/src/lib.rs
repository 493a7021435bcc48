//! Consortium Store - replicated document collections
//!
//! Every consortium owns one document collection. Clients append analysis
//! documents to it, the aggregation core rewrites a single aggregate
//! document, and everyone observes writes through a live change feed.
//!
//! # Contract
//!
//! [`DocumentStore`] is the whole surface the aggregation core relies on:
//!
//! - `all` / `get` / `save` / `update` for CRUD with revision checks
//! - `changes` for a live feed, optionally starting from "now"
//! - `set_security` / `get_security` for backends with access policies
//!
//! # Backends
//!
//! - [`MemoryStore`]: process-local, used for tests and ephemeral nodes
//! - [`RocksStore`]: RocksDB-backed, one database directory per store
//!
//! [`StoreFactory`] creates stores by name so higher layers stay backend
//! agnostic.

pub mod document;
pub mod error;
pub mod factory;
pub mod feed;
pub mod memory;
pub mod rocks;
pub mod security;

use async_trait::async_trait;

pub use document::{Document, GetOptions};
pub use error::{Result, StoreError};
pub use factory::{MemoryFactory, RocksFactory, StoreFactory};
pub use feed::{Change, ChangeFeed, ChangesOptions, Since};
pub use memory::MemoryStore;
pub use rocks::RocksStore;
pub use security::{Members, SecurityPolicy};

/// A consortium document collection.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Store name.
    fn name(&self) -> &str;

    /// Snapshot of every document.
    async fn all(&self) -> Result<Vec<Document>>;

    /// Fetch one document.
    async fn get(&self, id: &str, opts: GetOptions) -> Result<Document>;

    /// Insert a new document, assigning an id when empty and a revision.
    async fn save(&self, doc: Document) -> Result<Document>;

    /// Overwrite an existing document; `doc.rev` must match the stored revision.
    async fn update(&self, doc: Document) -> Result<Document>;

    /// Subscribe to changes.
    fn changes(&self, opts: ChangesOptions) -> Result<ChangeFeed>;

    /// Whether this backend enforces access policies.
    fn supports_security(&self) -> bool {
        false
    }

    /// Replace the store's access policy.
    async fn set_security(&self, _policy: SecurityPolicy) -> Result<()> {
        Err(StoreError::Unsupported("set_security"))
    }

    /// Current access policy.
    async fn get_security(&self) -> Result<SecurityPolicy> {
        Err(StoreError::Unsupported("get_security"))
    }
}
