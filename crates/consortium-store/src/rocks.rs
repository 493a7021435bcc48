//! Persistent document store using RocksDB.

use crate::document::{check_rev, derive_id, next_rev, Document, GetOptions};
use crate::error::{Result, StoreError};
use crate::feed::{Change, ChangeFeed, ChangeHub, ChangesOptions, DEFAULT_FEED_CAPACITY};
use crate::security::SecurityPolicy;
use crate::DocumentStore;
use async_trait::async_trait;
use rocksdb::{Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Mutex;

const DOC_PREFIX: &[u8] = b"doc:";
const SECURITY_KEY: &[u8] = b"meta:security";
const SEQ_KEY: &[u8] = b"meta:seq";

/// Document store backed by one RocksDB database.
pub struct RocksStore {
    name: String,
    db: DB,
    hub: ChangeHub,
    /// Serializes read-check-write sequences
    writer: Mutex<()>,
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("name", &self.name)
            .field("seq", &self.hub.last_seq())
            .finish()
    }
}

impl RocksStore {
    /// Open or create the store at the given path.
    pub fn open<P: AsRef<Path>>(name: impl Into<String>, path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;

        let seq = match db.get(SEQ_KEY)? {
            Some(data) => {
                let bytes: [u8; 8] = data
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Storage("invalid stored sequence".into()))?;
                u64::from_be_bytes(bytes)
            }
            None => 0,
        };

        Ok(Self {
            name: name.into(),
            db,
            hub: ChangeHub::starting_at(DEFAULT_FEED_CAPACITY, seq),
            writer: Mutex::new(()),
        })
    }

    fn doc_key(id: &str) -> Vec<u8> {
        let mut key = DOC_PREFIX.to_vec();
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn load(&self, id: &str) -> Result<Option<Document>> {
        match self.db.get(Self::doc_key(id))? {
            Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
            None => Ok(None),
        }
    }

    fn list(&self) -> Result<Vec<Document>> {
        let mut docs = Vec::new();

        let iter = self.db.prefix_iterator(DOC_PREFIX);
        for item in iter {
            let (key, value) = item?;
            if key.starts_with(DOC_PREFIX) {
                docs.push(serde_json::from_slice(&value)?);
            } else {
                break;
            }
        }

        Ok(docs)
    }

    /// Persist the document and the sequence atomically, then publish.
    fn commit(&self, seq: u64, mut doc: Document) -> Result<Document> {
        doc.rev = Some(next_rev(doc.generation(), &doc.body)?);

        let mut batch = WriteBatch::default();
        batch.put(Self::doc_key(&doc.id), serde_json::to_vec(&doc)?);
        batch.put(SEQ_KEY, seq.to_be_bytes());
        self.db.write(batch)?;

        self.hub.publish(Change {
            seq,
            id: doc.id.clone(),
            doc: doc.clone(),
        });
        Ok(doc)
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.writer
            .lock()
            .map_err(|_| StoreError::Storage(format!("{}: writer lock poisoned", self.name)))
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn all(&self) -> Result<Vec<Document>> {
        self.list()
    }

    async fn get(&self, id: &str, opts: GetOptions) -> Result<Document> {
        let doc = self
            .load(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(if opts.include_body { doc } else { doc.stub() })
    }

    async fn save(&self, mut doc: Document) -> Result<Document> {
        let _writer = self.lock_writer()?;
        let seq = self.hub.next_seq();
        if doc.id.is_empty() {
            doc.id = derive_id(&self.name, seq);
        }
        if self.load(&doc.id)?.is_some() {
            return Err(StoreError::AlreadyExists(doc.id));
        }
        doc.rev = None;
        self.commit(seq, doc)
    }

    async fn update(&self, doc: Document) -> Result<Document> {
        if doc.id.is_empty() {
            return Err(StoreError::InvalidDocument("update without _id".into()));
        }
        let _writer = self.lock_writer()?;
        let stored = self
            .load(&doc.id)?
            .ok_or_else(|| StoreError::NotFound(doc.id.clone()))?;
        check_rev(&doc, &stored)?;
        let seq = self.hub.next_seq();
        self.commit(seq, doc)
    }

    fn changes(&self, opts: ChangesOptions) -> Result<ChangeFeed> {
        ChangeFeed::open(&self.hub, opts, || self.list())
    }

    fn supports_security(&self) -> bool {
        true
    }

    async fn set_security(&self, policy: SecurityPolicy) -> Result<()> {
        self.db.put(SECURITY_KEY, serde_json::to_vec(&policy)?)?;
        Ok(())
    }

    async fn get_security(&self) -> Result<SecurityPolicy> {
        match self.db.get(SECURITY_KEY)? {
            Some(data) => Ok(serde_json::from_slice(&data)?),
            None => Ok(SecurityPolicy::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn storage_roundtrip() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open("test", dir.path()).unwrap();

        let saved = tokio_test::block_on(
            store.save(Document::new("agg").with_field("aggregate", json!(true))),
        )
        .unwrap();
        let loaded = tokio_test::block_on(store.get("agg", GetOptions::default())).unwrap();
        assert_eq!(saved, loaded);
        assert!(loaded.is_aggregate());
    }

    #[tokio::test]
    async fn list_documents() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open("test", dir.path()).unwrap();

        store.save(Document::new("a")).await.unwrap();
        store.save(Document::new("b")).await.unwrap();
        store.set_security(SecurityPolicy::private()).await.unwrap();

        // Metadata keys are not documents
        let docs = store.all().await.unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn reopen_keeps_documents_and_sequence() {
        let dir = tempdir().unwrap();
        let first_id = {
            let store = RocksStore::open("test", dir.path()).unwrap();
            store.save(Document::default()).await.unwrap().id
        };

        let store = RocksStore::open("test", dir.path()).unwrap();
        assert!(store.get(&first_id, GetOptions::stub_only()).await.is_ok());

        // Sequence resumes, so derived ids do not collide
        let second_id = store.save(Document::default()).await.unwrap().id;
        assert_ne!(first_id, second_id);
    }

    #[tokio::test]
    async fn update_conflict() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open("test", dir.path()).unwrap();

        let v1 = store.save(Document::new("a")).await.unwrap();
        store.update(v1.clone()).await.unwrap();
        assert!(matches!(
            store.update(v1).await,
            Err(StoreError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn security_persists() {
        let dir = tempdir().unwrap();
        {
            let store = RocksStore::open("test", dir.path()).unwrap();
            assert!(store.get_security().await.unwrap().allows_anonymous());
            store.set_security(SecurityPolicy::private()).await.unwrap();
        }
        let store = RocksStore::open("test", dir.path()).unwrap();
        assert_eq!(
            store.get_security().await.unwrap(),
            SecurityPolicy::private()
        );
    }
}
