//! Round coordinator.
//!
//! Every analysis change starts an independent pipeline:
//!
//! 1. Lock the consortium, re-read the store, classify, refresh the
//!    aggregate's contributor list (persisting only if it changed), unlock.
//! 2. Publish `WaitingOnAnalyses(missing)`, `AllAnalysesSubmitted` or
//!    `TooManyAnalyses`.
//! 3. When the round is complete (or overfull), lock again, re-read,
//!    re-classify, aggregate, persist, unlock.
//!
//! The second read matters: two pipelines can both see a complete round, and
//! whichever recomputes second finds the round already closed and skips.
//! Failures end at this boundary as log lines and `RoundEvent::Failed`;
//! nothing is retried until the next change.

use consortium_aggregate::{
    classify, multi_shot, refresh_contributors, single_shot, AggregateDocument, AggregateError,
    AnalysisDocument, Classification, ComputationMode, RoundOutcome, RoundStatus,
    SingleShotPolicy,
};
use consortium_store::DocumentStore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::lock::KeyedLock;
use crate::watcher::WatchEvent;

const EVENT_CAPACITY: usize = 256;

/// Progress signals for one consortium.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundEvent {
    /// The aggregate's contributor list was rewritten
    ContributorsUpdated { contributors: Vec<String> },
    /// Nothing new; no write happened
    ContributorsUnchanged,
    WaitingOnAnalyses { missing: usize },
    AllAnalysesSubmitted,
    /// More analyses than clients; the round will be rejected
    TooManyAnalyses { expected: usize, actual: usize },
    /// A round was aggregated and persisted
    Recomputed { round: usize, overshoot: bool },
    /// The computation stopped iterating
    Finished,
    Failed { reason: String },
}

/// Result of a recomputation attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Recomputation {
    Completed(RoundOutcome),
    /// Validation failed; the error was recorded on the aggregate
    Rejected(AggregateError),
    /// The round was not (or no longer) complete
    Skipped,
    /// The aggregate no longer iterates
    Finished,
}

/// Serializes round processing for one consortium store.
pub struct RoundCoordinator {
    name: String,
    store: Arc<dyn DocumentStore>,
    locks: Arc<KeyedLock>,
    policy: Arc<SingleShotPolicy>,
    events: broadcast::Sender<RoundEvent>,
}

impl RoundCoordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: Arc<KeyedLock>,
        policy: Arc<SingleShotPolicy>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            name: store.name().to_string(),
            store,
            locks,
            policy,
            events,
        }
    }

    /// Store name, which is also the lock key.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RoundEvent) {
        let _ = self.events.send(event);
    }

    async fn load(&self) -> Result<Classification> {
        let docs = self.store.all().await?;
        let classification = classify(&docs)?;
        for id in &classification.rejected {
            warn!(store = %self.name, id = %id, "ignoring document that is not an analysis");
        }
        for username in classification.duplicate_submitters() {
            warn!(store = %self.name, username = %username, "client submitted more than once this round");
        }
        Ok(classification)
    }

    async fn persist(&self, aggregate: &AggregateDocument) -> Result<()> {
        self.store.update(aggregate.to_document()?).await?;
        Ok(())
    }

    /// Rewrite the contributor list for the open round and report whether
    /// the round is complete. Does not aggregate.
    pub async fn refresh_contributors(&self) -> Result<RoundStatus> {
        let status = {
            let _guard = self.locks.acquire(&self.name).await;
            let classification = self.load().await?;
            let mut aggregate = classification.aggregate()?.clone();

            if refresh_contributors(&mut aggregate, &classification.contributing) {
                self.persist(&aggregate).await?;
                debug!(store = %self.name, contributors = ?aggregate.contributors, "contributors updated");
                self.emit(RoundEvent::ContributorsUpdated {
                    contributors: aggregate.contributors.clone(),
                });
            } else {
                debug!(store = %self.name, "contributors unchanged");
                self.emit(RoundEvent::ContributorsUnchanged);
            }
            classification.status()?
        };

        match status {
            RoundStatus::Waiting { missing } => {
                debug!(store = %self.name, missing, "waiting on analyses");
                self.emit(RoundEvent::WaitingOnAnalyses { missing });
            }
            RoundStatus::Complete => {
                info!(store = %self.name, "all analyses submitted");
                self.emit(RoundEvent::AllAnalysesSubmitted);
            }
            RoundStatus::Overfull { expected, actual } => {
                warn!(store = %self.name, expected, actual, "more analyses than clients");
                self.emit(RoundEvent::TooManyAnalyses { expected, actual });
            }
        }
        Ok(status)
    }

    /// Aggregate the open round if it is complete, and persist the result.
    pub async fn recompute(&self) -> Result<Recomputation> {
        let _guard = self.locks.acquire(&self.name).await;
        let classification = self.load().await?;
        let previous = classification.aggregate()?;

        if !previous.iterate {
            debug!(store = %self.name, "computation finished, not recomputing");
            self.emit(RoundEvent::Finished);
            return Ok(Recomputation::Finished);
        }
        if let RoundStatus::Waiting { missing } = classification.status()? {
            debug!(store = %self.name, missing, "round not complete, skipping recompute");
            return Ok(Recomputation::Skipped);
        }

        match self.aggregate(previous, &classification.contributing) {
            Ok((next, outcome)) => {
                self.persist(&next).await?;
                info!(
                    store = %self.name,
                    round = outcome.round,
                    overshoot = outcome.overshoot,
                    learning_rate = next.data.learning_rate,
                    "round recomputed"
                );
                self.emit(RoundEvent::Recomputed {
                    round: outcome.round,
                    overshoot: outcome.overshoot,
                });
                if !next.iterate {
                    self.emit(RoundEvent::Finished);
                }
                Ok(Recomputation::Completed(outcome))
            }
            Err(e) => {
                warn!(store = %self.name, "round rejected: {}", e);
                let reason = e.to_string();
                if previous.error.as_deref() != Some(reason.as_str()) {
                    let mut failed = previous.clone();
                    failed.error = Some(reason.clone());
                    self.persist(&failed).await?;
                }
                self.emit(RoundEvent::Failed { reason });
                Ok(Recomputation::Rejected(e))
            }
        }
    }

    /// Run the aggregation path selected by the aggregate's mode.
    fn aggregate(
        &self,
        previous: &AggregateDocument,
        contributing: &[AnalysisDocument],
    ) -> consortium_aggregate::Result<(AggregateDocument, RoundOutcome)> {
        match previous.mode {
            ComputationMode::MultiShot => multi_shot::recompute(previous, contributing),
            ComputationMode::SingleShot => {
                let mut rng = rand::thread_rng();
                single_shot::recompute(previous, contributing, &self.policy, &mut rng)
            }
        }
    }

    /// Full pipeline for one analysis change.
    pub async fn on_analysis_changed(&self) -> Result<Option<Recomputation>> {
        match self.refresh_contributors().await? {
            RoundStatus::Waiting { .. } => Ok(None),
            RoundStatus::Complete | RoundStatus::Overfull { .. } => {
                Ok(Some(self.recompute().await?))
            }
        }
    }

    async fn run_pipeline(&self, trigger: &str) {
        if let Err(e) = self.on_analysis_changed().await {
            error!(store = %self.name, trigger, "round pipeline failed: {}", e);
            self.emit(RoundEvent::Failed {
                reason: e.to_string(),
            });
        }
    }

    /// Consume watcher events, spawning one pipeline per analysis change.
    pub fn spawn(self: Arc<Self>, mut watch: broadcast::Receiver<WatchEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match watch.recv().await {
                    Ok(WatchEvent::ChangedAnalysis(doc)) => {
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.run_pipeline(&doc.id).await });
                    }
                    Ok(WatchEvent::Error(e)) => {
                        error!(store = %self.name, "watcher stopped: {}", e);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        // State is re-read in full, so one pipeline covers the gap
                        warn!(store = %self.name, skipped, "missed watcher events");
                        let this = Arc::clone(&self);
                        tokio::spawn(async move { this.run_pipeline("lagged").await });
                    }
                    Err(RecvError::Closed) => {
                        debug!(store = %self.name, "watcher dropped");
                        return;
                    }
                }
            }
        })
    }
}
