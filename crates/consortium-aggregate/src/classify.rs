//! Round classification.
//!
//! A store snapshot splits into exactly one aggregate, every analysis, and
//! the analyses of the round currently being assembled: those whose history
//! length is `aggregate.history.len() + 1`.

use crate::error::{AggregateError, Result};
use crate::model::{AggregateDocument, AnalysisDocument};
use consortium_store::Document;
use std::collections::BTreeSet;

/// A classified store snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    /// The aggregate; `None` stands in for a missing one
    pub aggregate: Option<AggregateDocument>,
    /// Every non-aggregate document that parsed as an analysis
    pub analyses: Vec<AnalysisDocument>,
    /// Analyses of the open round, ordered by username then id
    pub contributing: Vec<AnalysisDocument>,
    /// Ids of non-aggregate documents that are not analyses
    pub rejected: Vec<String>,
}

impl Classification {
    /// The aggregate, or [`AggregateError::MissingAggregate`].
    pub fn aggregate(&self) -> Result<&AggregateDocument> {
        self.aggregate.as_ref().ok_or(AggregateError::MissingAggregate)
    }

    /// Completion state of the open round.
    pub fn status(&self) -> Result<RoundStatus> {
        Ok(RoundStatus::of(
            self.contributing.len(),
            self.aggregate()?.client_count,
        ))
    }

    /// Usernames of the open round's contributors, sorted and deduplicated.
    pub fn contributor_names(&self) -> Vec<String> {
        contributor_names(&self.contributing)
    }

    /// Usernames with more than one analysis in the open round. The round
    /// still counts documents, so these can complete it early.
    pub fn duplicate_submitters(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        for analysis in &self.contributing {
            if !seen.insert(analysis.username.as_str()) {
                duplicates.insert(analysis.username.clone());
            }
        }
        duplicates.into_iter().collect()
    }
}

/// Partition a store snapshot. Inputs are not modified and their order does
/// not affect the result.
pub fn classify(docs: &[Document]) -> Result<Classification> {
    let mut aggregate: Option<AggregateDocument> = None;
    let mut analyses = Vec::new();
    let mut rejected = Vec::new();

    for doc in docs {
        if doc.is_aggregate() {
            let parsed = AggregateDocument::from_document(doc)?;
            if let Some(existing) = &aggregate {
                let (first, second) = if existing.id <= parsed.id {
                    (existing.id.clone(), parsed.id)
                } else {
                    (parsed.id, existing.id.clone())
                };
                return Err(AggregateError::DuplicateAggregate { first, second });
            }
            aggregate = Some(parsed);
        } else {
            match doc.to_typed::<AnalysisDocument>() {
                Ok(analysis) => analyses.push(analysis),
                Err(_) => rejected.push(doc.id.clone()),
            }
        }
    }

    analyses.sort_by(|a, b| (&a.username, &a.id).cmp(&(&b.username, &b.id)));
    rejected.sort();

    let open_round = aggregate.as_ref().map_or(1, AggregateDocument::open_round);
    let contributing = analyses
        .iter()
        .filter(|a| a.round() == open_round)
        .cloned()
        .collect();

    Ok(Classification {
        aggregate,
        analyses,
        contributing,
        rejected,
    })
}

/// Completion state of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    /// Still waiting for `missing` clients
    Waiting { missing: usize },
    /// Exactly `clientCount` analyses present
    Complete,
    /// More analyses than clients; never aggregated
    Overfull { expected: usize, actual: usize },
}

impl RoundStatus {
    /// Compare submitted analyses against the expected client count.
    pub fn of(submitted: usize, client_count: usize) -> Self {
        if submitted > client_count {
            RoundStatus::Overfull {
                expected: client_count,
                actual: submitted,
            }
        } else if submitted == client_count && submitted > 0 {
            RoundStatus::Complete
        } else {
            RoundStatus::Waiting {
                missing: client_count - submitted,
            }
        }
    }
}

/// Fail unless exactly `client_count` analyses were submitted.
pub fn ensure_complete(submitted: usize, client_count: usize) -> Result<()> {
    match RoundStatus::of(submitted, client_count) {
        RoundStatus::Complete => Ok(()),
        RoundStatus::Overfull { expected, actual } => {
            Err(AggregateError::TooManyAnalyses { expected, actual })
        }
        RoundStatus::Waiting { .. } if submitted == 0 => Err(AggregateError::EmptyRound),
        RoundStatus::Waiting { .. } => Err(AggregateError::IncompleteRound {
            expected: client_count,
            actual: submitted,
        }),
    }
}

/// Sorted, deduplicated usernames.
pub fn contributor_names(analyses: &[AnalysisDocument]) -> Vec<String> {
    analyses
        .iter()
        .map(|a| a.username.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Replace the aggregate's contributor list with the open round's submitters.
///
/// Returns `true` when the list changed. When it did not, the aggregate is
/// marked `unchanged` and callers skip persisting it.
pub fn refresh_contributors(
    aggregate: &mut AggregateDocument,
    contributing: &[AnalysisDocument],
) -> bool {
    let next = contributor_names(contributing);
    let previous: BTreeSet<&String> = aggregate.contributors.iter().collect();
    let changed = previous != next.iter().collect::<BTreeSet<_>>();

    aggregate.unchanged = !changed;
    if changed {
        aggregate.contributors = next;
    }
    changed
}
