//! Live change feed.
//!
//! Every write publishes a [`Change`] on a broadcast hub owned by the store.
//! A [`ChangeFeed`] is one subscriber: an optional backlog (history replay)
//! followed by live changes. A subscriber that falls behind the hub's buffer
//! gets [`StoreError::FeedLagged`] once and then the feed is finished.

use crate::document::Document;
use crate::error::{Result, StoreError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

/// Default buffered changes per store before slow subscribers lag.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// One mutation as seen by feed subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    /// Store-local sequence number, strictly increasing per write
    pub seq: u64,
    /// Id of the written document
    pub id: String,
    /// The document as written
    pub doc: Document,
}

/// Where a feed starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Since {
    /// Only changes made after subscription
    Now,
    /// Replay every current document first
    Beginning,
}

/// Options for [`crate::DocumentStore::changes`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangesOptions {
    /// Keep streaming after the backlog is drained
    pub live: bool,
    /// Starting point
    pub since: Since,
}

impl Default for ChangesOptions {
    fn default() -> Self {
        Self::live_from_now()
    }
}

impl ChangesOptions {
    /// `{ live: true, since: "now" }`
    pub fn live_from_now() -> Self {
        Self {
            live: true,
            since: Since::Now,
        }
    }
}

/// Per-store publisher of changes.
#[derive(Debug)]
pub(crate) struct ChangeHub {
    tx: broadcast::Sender<Change>,
    seq: AtomicU64,
}

impl ChangeHub {
    pub(crate) fn new(capacity: usize) -> Self {
        Self::starting_at(capacity, 0)
    }

    /// Resume numbering after `seq` (reopened persistent stores).
    pub(crate) fn starting_at(capacity: usize, seq: u64) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            seq: AtomicU64::new(seq),
        }
    }

    /// Allocate the next sequence number.
    pub(crate) fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last allocated sequence number.
    pub(crate) fn last_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Publish a change; no subscribers is not an error.
    pub(crate) fn publish(&self, change: Change) {
        let _ = self.tx.send(change);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Change> {
        self.tx.subscribe()
    }
}

/// A subscription to a store's changes.
#[derive(Debug)]
pub struct ChangeFeed {
    backlog: VecDeque<Change>,
    live: Option<broadcast::Receiver<Change>>,
}

impl ChangeFeed {
    pub(crate) fn new(backlog: Vec<Change>, live: Option<broadcast::Receiver<Change>>) -> Self {
        Self {
            backlog: backlog.into(),
            live,
        }
    }

    /// Build a feed for `opts` from a hub and a snapshot provider.
    ///
    /// The live receiver is taken before the snapshot so no write can fall
    /// between them; a document may then appear twice, never zero times.
    pub(crate) fn open<F>(hub: &ChangeHub, opts: ChangesOptions, snapshot: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Vec<Document>>,
    {
        let live = opts.live.then(|| hub.subscribe());
        let backlog = match opts.since {
            Since::Now => Vec::new(),
            Since::Beginning => {
                let seq = hub.last_seq();
                snapshot()?
                    .into_iter()
                    .map(|doc| Change {
                        seq,
                        id: doc.id.clone(),
                        doc,
                    })
                    .collect()
            }
        };
        Ok(Self::new(backlog, live))
    }

    /// Next change, `None` once the feed is finished.
    pub async fn next(&mut self) -> Option<Result<Change>> {
        if let Some(change) = self.backlog.pop_front() {
            return Some(Ok(change));
        }
        let rx = self.live.as_mut()?;
        match rx.recv().await {
            Ok(change) => Some(Ok(change)),
            Err(RecvError::Lagged(skipped)) => {
                self.live = None;
                Some(Err(StoreError::FeedLagged(skipped)))
            }
            Err(RecvError::Closed) => {
                self.live = None;
                None
            }
        }
    }

    /// Whether more changes can still arrive.
    pub fn is_open(&self) -> bool {
        !self.backlog.is_empty() || self.live.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(hub: &ChangeHub, id: &str) -> Change {
        Change {
            seq: hub.next_seq(),
            id: id.to_string(),
            doc: Document::new(id),
        }
    }

    #[tokio::test]
    async fn since_now_skips_history() {
        let hub = ChangeHub::new(8);
        let mut feed = ChangeFeed::open(&hub, ChangesOptions::live_from_now(), || {
            Ok(vec![Document::new("old")])
        })
        .unwrap();

        hub.publish(change(&hub, "new"));
        let got = feed.next().await.unwrap().unwrap();
        assert_eq!(got.id, "new");
        assert_eq!(got.seq, 1);
    }

    #[tokio::test]
    async fn non_live_feed_ends_after_backlog() {
        let hub = ChangeHub::new(8);
        let opts = ChangesOptions {
            live: false,
            since: Since::Beginning,
        };
        let mut feed = ChangeFeed::open(&hub, opts, || {
            Ok(vec![Document::new("a"), Document::new("b")])
        })
        .unwrap();

        assert_eq!(feed.next().await.unwrap().unwrap().id, "a");
        assert_eq!(feed.next().await.unwrap().unwrap().id, "b");
        assert!(feed.next().await.is_none());
        assert!(!feed.is_open());
    }

    #[tokio::test]
    async fn lagging_subscriber_fails_once_then_ends() {
        let hub = ChangeHub::new(2);
        let mut feed =
            ChangeFeed::open(&hub, ChangesOptions::live_from_now(), || Ok(vec![])).unwrap();

        for i in 0..5 {
            hub.publish(change(&hub, &format!("d{}", i)));
        }

        assert!(matches!(
            feed.next().await,
            Some(Err(StoreError::FeedLagged(3)))
        ));
        assert!(feed.next().await.is_none());
    }
}
