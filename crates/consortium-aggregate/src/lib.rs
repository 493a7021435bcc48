//! Consortium Aggregation
//!
//! Sites never share raw data. Each round every site writes an analysis
//! document (a local objective and gradient, or a handful of feature values)
//! into the consortium store; once every expected site has written one, the
//! round's analyses are merged into the single aggregate document that the
//! sites read back to start the next round.
//!
//! # Rounds
//!
//! The round an analysis belongs to is the length of its `history`. The open
//! round is `aggregate.history.len() + 1`, and it is complete when exactly
//! `clientCount` analyses belong to it. Fewer means wait; more is an error
//! and is never aggregated.
//!
//! # Modes
//!
//! - **Multi-shot** ([`multi_shot`]): summed objective and gradient drive a
//!   gradient step. A round that fails to improve the objective halves the
//!   learning rate and retakes the step from the last accepted point.
//! - **Single-shot** ([`single_shot`]): column-wise means released through
//!   the Laplace mechanism ([`noise`]).
//!
//! Everything here is synchronous and pure; storage, locking and scheduling
//! live in `consortium-node`.

pub mod classify;
pub mod error;
pub mod model;
pub mod multi_shot;
pub mod noise;
pub mod single_shot;

pub use classify::{
    classify, contributor_names, ensure_complete, refresh_contributors, Classification,
    RoundStatus,
};
pub use error::{AggregateError, Result};
pub use model::{
    AggregateData, AggregateDocument, AggregateSeed, AggregateSnapshot, AnalysisDocument,
    ComputationMode, Consortium, FeatureMap, MultiShotResult, AGGREGATE_ID,
};
pub use multi_shot::RoundOutcome;
pub use noise::Laplace;
pub use single_shot::{FeatureBounds, NoiseMode, SingleShotPolicy};

#[cfg(test)]
mod tests {
    use super::*;
    use consortium_store::Document;
    use serde_json::json;

    /// A full round trip through store documents: seed, two sites, classify,
    /// recompute, and the next round starts empty.
    #[test]
    fn round_lifecycle() {
        let agg = AggregateDocument::seed(&Consortium::new("study", 2), &AggregateSeed::default())
            .unwrap();
        let mut docs: Vec<Document> = vec![agg.to_document().unwrap()];
        for (id, user) in [("a", "alice"), ("b", "bob")] {
            let mut analysis = AnalysisDocument::new(
                user,
                1,
                json!({"objective": 1.0, "gradient": {"x": 1.0}, "r2": 0.5}),
            );
            analysis.id = id.into();
            docs.push(analysis.to_document().unwrap());
        }

        let c = classify(&docs).unwrap();
        assert_eq!(c.status().unwrap(), RoundStatus::Complete);

        let (next, outcome) = multi_shot::recompute(c.aggregate().unwrap(), &c.contributing).unwrap();
        assert_eq!(outcome.round, 1);

        docs[0] = next.to_document().unwrap();
        let c = classify(&docs).unwrap();
        assert!(c.contributing.is_empty());
        assert_eq!(c.status().unwrap(), RoundStatus::Waiting { missing: 2 });
    }
}
