//! Change watcher: classifies store changes into typed events.
//!
//! ```text
//!   Idle ──start()──▶ Watching ──feed error / stop()──▶ Idle
//! ```
//!
//! For every change the watcher publishes `Changed(doc)` and then exactly one
//! of `ChangedAggregate(doc)` / `ChangedAnalysis(doc)`. A feed error is
//! published as `Error` and the watcher goes idle; re-subscribing is the
//! caller's call. The watcher never locks or aggregates.

use consortium_store::{ChangesOptions, Document, DocumentStore, StoreError};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::Result;

/// Buffered events per subscriber.
const EVENT_CAPACITY: usize = 256;

/// Events published by a [`ChangeWatcher`].
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Any document changed
    Changed(Document),
    /// The aggregate document changed
    ChangedAggregate(Document),
    /// An analysis document changed
    ChangedAnalysis(Document),
    /// The feed failed; no further events until restarted
    Error(Arc<StoreError>),
}

impl WatchEvent {
    /// Event name as seen by subscribers.
    pub fn name(&self) -> &'static str {
        match self {
            WatchEvent::Changed(_) => "changed",
            WatchEvent::ChangedAggregate(_) => "changed:aggregate",
            WatchEvent::ChangedAnalysis(_) => "changed:analysis",
            WatchEvent::Error(_) => "error",
        }
    }
}

/// Watcher lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Watching,
}

/// Subscribes to one store's live feed and forwards classified events.
pub struct ChangeWatcher {
    store: Arc<dyn DocumentStore>,
    events: broadcast::Sender<WatchEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeWatcher {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            events,
            task: Mutex::new(None),
        }
    }

    /// Subscribe to events. Subscribe before [`start`](Self::start) to see
    /// every change.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> WatcherState {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        match task.as_ref() {
            Some(handle) if !handle.is_finished() => WatcherState::Watching,
            _ => WatcherState::Idle,
        }
    }

    /// Subscribe to the store's feed from "now" and start forwarding.
    ///
    /// The feed is open when this returns. Starting a watching watcher is a
    /// no-op.
    pub fn start(&self) -> Result<()> {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if matches!(task.as_ref(), Some(handle) if !handle.is_finished()) {
            return Ok(());
        }

        let mut feed = self.store.changes(ChangesOptions::live_from_now())?;
        let events = self.events.clone();
        let name = self.store.name().to_string();
        info!(store = %name, "watching for changes");

        *task = Some(tokio::spawn(async move {
            while let Some(next) = feed.next().await {
                match next {
                    Ok(change) => {
                        let doc = change.doc;
                        let classified = if doc.is_aggregate() {
                            WatchEvent::ChangedAggregate(doc.clone())
                        } else {
                            WatchEvent::ChangedAnalysis(doc.clone())
                        };
                        debug!(store = %name, id = %change.id, seq = change.seq, event = classified.name(), "change");
                        // No subscribers is fine
                        let _ = events.send(WatchEvent::Changed(doc));
                        let _ = events.send(classified);
                    }
                    Err(e) => {
                        error!(store = %name, "change feed failed: {}", e);
                        let _ = events.send(WatchEvent::Error(Arc::new(e)));
                        return;
                    }
                }
            }
            debug!(store = %name, "change feed closed");
        }));
        Ok(())
    }

    /// Unsubscribe from the feed.
    pub fn stop(&self) {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
            info!(store = %self.store.name(), "stopped watching");
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
