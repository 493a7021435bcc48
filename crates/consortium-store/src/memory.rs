//! In-process document store.

use crate::document::{check_rev, derive_id, next_rev, Document, GetOptions};
use crate::error::{Result, StoreError};
use crate::feed::{Change, ChangeFeed, ChangeHub, ChangesOptions, DEFAULT_FEED_CAPACITY};
use crate::security::SecurityPolicy;
use crate::DocumentStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Document store held entirely in memory.
#[derive(Debug)]
pub struct MemoryStore {
    name: String,
    docs: RwLock<BTreeMap<String, Document>>,
    hub: ChangeHub,
    /// `Some` when the store is security-aware
    security: Option<RwLock<SecurityPolicy>>,
}

impl MemoryStore {
    /// Create an empty store without access-policy support.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_FEED_CAPACITY)
    }

    /// Create an empty store with a custom change-feed buffer.
    pub fn with_capacity(name: impl Into<String>, feed_capacity: usize) -> Self {
        Self {
            name: name.into(),
            docs: RwLock::new(BTreeMap::new()),
            hub: ChangeHub::new(feed_capacity),
            security: None,
        }
    }

    /// Create an empty store that enforces access policies.
    pub fn secured(name: impl Into<String>) -> Self {
        Self {
            security: Some(RwLock::new(SecurityPolicy::default())),
            ..Self::new(name)
        }
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.read().map(|docs| docs.len()).unwrap_or(0)
    }

    /// True when no document is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Document>>> {
        self.docs
            .read()
            .map_err(|_| StoreError::Storage(format!("{}: lock poisoned", self.name)))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Document>>> {
        self.docs
            .write()
            .map_err(|_| StoreError::Storage(format!("{}: lock poisoned", self.name)))
    }

    fn snapshot(&self) -> Result<Vec<Document>> {
        Ok(self.read()?.values().cloned().collect())
    }

    /// Commit a write and publish it while still holding the write lock so
    /// feed order matches write order.
    fn commit(
        &self,
        docs: &mut BTreeMap<String, Document>,
        seq: u64,
        mut doc: Document,
    ) -> Result<Document> {
        doc.rev = Some(next_rev(doc.generation(), &doc.body)?);
        docs.insert(doc.id.clone(), doc.clone());
        self.hub.publish(Change {
            seq,
            id: doc.id.clone(),
            doc: doc.clone(),
        });
        Ok(doc)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn all(&self) -> Result<Vec<Document>> {
        self.snapshot()
    }

    async fn get(&self, id: &str, opts: GetOptions) -> Result<Document> {
        let docs = self.read()?;
        let doc = docs
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(if opts.include_body {
            doc.clone()
        } else {
            doc.stub()
        })
    }

    async fn save(&self, mut doc: Document) -> Result<Document> {
        let mut docs = self.write()?;
        let seq = self.hub.next_seq();
        if doc.id.is_empty() {
            doc.id = derive_id(&self.name, seq);
        }
        if docs.contains_key(&doc.id) {
            return Err(StoreError::AlreadyExists(doc.id));
        }
        doc.rev = None;
        self.commit(&mut docs, seq, doc)
    }

    async fn update(&self, doc: Document) -> Result<Document> {
        if doc.id.is_empty() {
            return Err(StoreError::InvalidDocument("update without _id".into()));
        }
        let mut docs = self.write()?;
        let stored = docs
            .get(&doc.id)
            .ok_or_else(|| StoreError::NotFound(doc.id.clone()))?;
        check_rev(&doc, stored)?;
        let seq = self.hub.next_seq();
        self.commit(&mut docs, seq, doc)
    }

    fn changes(&self, opts: ChangesOptions) -> Result<ChangeFeed> {
        ChangeFeed::open(&self.hub, opts, || self.snapshot())
    }

    fn supports_security(&self) -> bool {
        self.security.is_some()
    }

    async fn set_security(&self, policy: SecurityPolicy) -> Result<()> {
        let lock = self
            .security
            .as_ref()
            .ok_or(StoreError::Unsupported("set_security"))?;
        let mut current = lock
            .write()
            .map_err(|_| StoreError::Storage(format!("{}: lock poisoned", self.name)))?;
        *current = policy;
        Ok(())
    }

    async fn get_security(&self) -> Result<SecurityPolicy> {
        let lock = self
            .security
            .as_ref()
            .ok_or(StoreError::Unsupported("get_security"))?;
        let current = lock
            .read()
            .map_err(|_| StoreError::Storage(format!("{}: lock poisoned", self.name)))?;
        Ok(current.clone())
    }
}
