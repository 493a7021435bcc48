//! Consortium registry.
//!
//! One handle per normalized consortium id, process-wide. First access
//! creates the store, locks it down, and wires a watcher to a coordinator;
//! concurrent first accesses for the same id wait on the same
//! initialization.

use consortium_aggregate::{AggregateDocument, AggregateSeed, Consortium, SingleShotPolicy};
use consortium_store::{DocumentStore, SecurityPolicy, StoreError, StoreFactory};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::coordinator::RoundCoordinator;
use crate::error::{Error, Result};
use crate::lock::KeyedLock;
use crate::watcher::ChangeWatcher;

/// Prefix for store names unless configured otherwise.
pub const DEFAULT_STORE_PREFIX: &str = "consortium-";

/// Normalize a consortium id: lowercase, runs of anything that is not
/// alphanumeric become one `-`, no leading or trailing `-`.
pub fn slugify(id: &str) -> String {
    let mut slug = String::with_capacity(id.len());
    let mut pending_dash = false;
    for c in id.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}

/// An open consortium: its store, watcher and coordinator.
pub struct ConsortiumHandle {
    pub id: String,
    pub store: Arc<dyn DocumentStore>,
    pub watcher: ChangeWatcher,
    pub coordinator: Arc<RoundCoordinator>,
    task: JoinHandle<()>,
}

impl ConsortiumHandle {
    /// Store name.
    pub fn name(&self) -> &str {
        self.store.name()
    }

    fn close(&self) {
        self.watcher.stop();
        self.task.abort();
    }
}

type Slot = Arc<OnceCell<Arc<ConsortiumHandle>>>;

/// Creates and caches consortium handles.
pub struct ConsortiumRegistry {
    factory: Arc<dyn StoreFactory>,
    prefix: String,
    seed: AggregateSeed,
    policy: Arc<SingleShotPolicy>,
    locks: Arc<KeyedLock>,
    entries: Mutex<HashMap<String, Slot>>,
}

impl ConsortiumRegistry {
    pub fn new(factory: Arc<dyn StoreFactory>) -> Self {
        Self {
            factory,
            prefix: DEFAULT_STORE_PREFIX.to_string(),
            seed: AggregateSeed::default(),
            policy: Arc::new(SingleShotPolicy::default()),
            locks: Arc::new(KeyedLock::new()),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Seed values for aggregates created by [`provision`](Self::provision).
    pub fn with_seed(mut self, seed: AggregateSeed) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_policy(mut self, policy: SingleShotPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Lock map shared by every coordinator of this registry.
    pub fn locks(&self) -> &Arc<KeyedLock> {
        &self.locks
    }

    /// Deterministic store name for a consortium id.
    pub fn store_name(&self, id: &str) -> Result<String> {
        let slug = slugify(id);
        if slug.is_empty() {
            return Err(Error::InvalidInput(format!(
                "consortium id {:?} has no usable characters",
                id
            )));
        }
        Ok(format!("{}{}", self.prefix, slug))
    }

    fn slot(&self, name: &str) -> Slot {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(entries.entry(name.to_string()).or_default())
    }

    /// Return the handle for `id`, creating it on first use.
    ///
    /// A failed creation leaves nothing cached; the next call tries again.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<ConsortiumHandle>> {
        let name = self.store_name(id)?;
        let slot = self.slot(&name);
        let handle = slot
            .get_or_try_init(|| async {
                self.open(id, &name).await.map_err(|e| {
                    error!(store = %name, "failed to open consortium: {}", e);
                    e
                })
            })
            .await?;
        Ok(Arc::clone(handle))
    }

    /// Cached handle for `id`, if already open.
    pub fn get(&self, id: &str) -> Option<Arc<ConsortiumHandle>> {
        let name = self.store_name(id).ok()?;
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.get(&name)?.get().cloned()
    }

    async fn open(&self, id: &str, name: &str) -> Result<Arc<ConsortiumHandle>> {
        let store = self.factory.create(name).await?;

        if store.supports_security() {
            let policy = SecurityPolicy::private();
            store.set_security(policy.clone()).await?;
            let applied = store.get_security().await?;
            if applied != policy {
                return Err(Error::Security(format!(
                    "store {} did not keep the private policy",
                    name
                )));
            }
            info!(store = %name, "applied private security policy");
        }

        let watcher = ChangeWatcher::new(Arc::clone(&store));
        let coordinator = Arc::new(RoundCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&self.locks),
            Arc::clone(&self.policy),
        ));
        // Subscribe before the feed opens so no change is missed
        let task = Arc::clone(&coordinator).spawn(watcher.subscribe());
        if let Err(e) = watcher.start() {
            task.abort();
            return Err(e);
        }

        info!(store = %name, consortium = %id, "consortium ready");
        Ok(Arc::new(ConsortiumHandle {
            id: id.to_string(),
            store,
            watcher,
            coordinator,
            task,
        }))
    }

    /// Open the consortium and seed its aggregate if the store has none.
    pub async fn provision(&self, consortium: &Consortium) -> Result<Arc<ConsortiumHandle>> {
        let handle = self.get_or_create(&consortium.id).await?;
        let aggregate = AggregateDocument::seed(consortium, &self.seed)?;

        let _guard = self.locks.acquire(handle.name()).await;
        let existing = handle.store.all().await?;
        if existing.iter().any(|doc| doc.is_aggregate()) {
            return Ok(handle);
        }
        match handle.store.save(aggregate.to_document()?).await {
            Ok(_) => {
                info!(
                    store = %handle.name(),
                    client_count = consortium.client_count,
                    mode = ?consortium.mode,
                    "seeded aggregate"
                );
            }
            Err(StoreError::AlreadyExists(_)) => {
                warn!(store = %handle.name(), "aggregate appeared while seeding");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(handle)
    }

    /// Number of open consortia.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every watcher and coordinator.
    pub fn shutdown(&self) {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        for handle in entries.values().filter_map(|slot| slot.get()) {
            handle.close();
        }
        info!(count = entries.len(), "registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugs() {
        assert_eq!(slugify("My Study"), "my-study");
        assert_eq!(slugify("  my--study!! "), "my-study");
        assert_eq!(slugify("ABC_123"), "abc-123");
        assert_eq!(slugify("***"), "");
    }

    #[test]
    fn store_names() {
        let registry = ConsortiumRegistry::new(Arc::new(consortium_store::MemoryFactory::new()));
        assert_eq!(registry.store_name("My Study").unwrap(), "consortium-my-study");
        assert!(matches!(
            registry.store_name("!!"),
            Err(Error::InvalidInput(_))
        ));

        let custom = ConsortiumRegistry::new(Arc::new(consortium_store::MemoryFactory::new()))
            .with_prefix("c_");
        assert_eq!(custom.store_name("x").unwrap(), "c_x");
    }
}
