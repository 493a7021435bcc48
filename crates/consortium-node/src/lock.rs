//! Keyed mutual exclusion.
//!
//! One async mutex per key, created on first use. Recomputation pipelines
//! for the same consortium queue behind its mutex; different consortia
//! never contend. Release is tied to dropping the [`KeyedGuard`], so every
//! exit path (`?`, early return, panic) releases exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

/// Map from key to mutex, safe for concurrent access.
#[derive(Debug, Default)]
pub struct KeyedLock {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// Held lock for one key.
#[derive(Debug)]
pub struct KeyedGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyedGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        trace!(key = %self.key, "lock released");
    }
}

impl KeyedLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, key: &str) -> Arc<AsyncMutex<()>> {
        // The map only ever gains entries, so a poisoned map is still consistent
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Wait for and take the lock for `key`.
    pub async fn acquire(&self, key: &str) -> KeyedGuard {
        let guard = self.mutex(key).lock_owned().await;
        trace!(key, "lock acquired");
        KeyedGuard {
            key: key.to_string(),
            _guard: guard,
        }
    }

    /// Take the lock for `key` if it is free.
    pub fn try_acquire(&self, key: &str) -> Option<KeyedGuard> {
        let guard = self.mutex(key).try_lock_owned().ok()?;
        Some(KeyedGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Whether some pipeline currently holds `key`.
    pub fn is_locked(&self, key: &str) -> bool {
        self.mutex(key).try_lock().is_err()
    }

    /// Number of keys ever locked.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
