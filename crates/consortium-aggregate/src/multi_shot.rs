//! Iterative multi-shot aggregation.
//!
//! Each round every site reports its local objective and gradient evaluated
//! at the current model values. The aggregate objective and gradient are
//! the sums over sites. A round that fails to lower the objective is an
//! overshoot: the learning rate halves and the step is retaken from the
//! last accepted point with the last accepted gradient. Otherwise the new
//! gradient is accepted, the model steps from the point the sites just
//! evaluated, and `previousMVals` advances to the new values.
//!
//! ```text
//! accepted:   mVals <- mVals - lr * g_new
//!             prev  <- mVals
//! overshoot:  lr    <- lr / 2
//!             mVals <- prev - lr * g_prev
//! ```
//!
//! The learning rate never increases. The computation is a pure function of
//! the previous aggregate and the analyses.

use crate::classify::{contributor_names, ensure_complete};
use crate::error::{AggregateError, Result};
use crate::model::{AggregateDocument, AnalysisDocument, FeatureMap, MultiShotResult};
use std::collections::BTreeSet;

/// What a recomputation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundOutcome {
    /// History length after the round
    pub round: usize,
    /// The round's objective did not improve
    pub overshoot: bool,
}

/// Compute the aggregate that follows `previous` given the open round's
/// analyses. Requires exactly `client_count` analyses.
pub fn recompute(
    previous: &AggregateDocument,
    contributing: &[AnalysisDocument],
) -> Result<(AggregateDocument, RoundOutcome)> {
    ensure_complete(contributing.len(), previous.client_count)?;

    let results = contributing
        .iter()
        .map(|a| a.multi_shot().map(|r| (a.username.as_str(), r)))
        .collect::<Result<Vec<_>>>()?;

    let features = feature_set(previous, &results);
    let (objective, gradient) = sum_contributions(&features, &results)?;
    let r2 = results.iter().map(|(_, r)| r.r2).sum::<f64>() / results.len() as f64;

    let prev = &previous.data;
    let overshoot = !prev.is_initial() && objective >= prev.objective;

    let mut next = previous.clone();
    next.data.r2 = r2;
    if overshoot {
        next.data.learning_rate = prev.learning_rate / 2.0;
        next.data.m_vals = step(
            &features,
            &prev.previous_m_vals,
            &prev.gradient,
            next.data.learning_rate,
        );
    } else {
        next.data.m_vals = step(&features, &prev.m_vals, &gradient, prev.learning_rate);
        next.data.previous_m_vals = next.data.m_vals.clone();
        next.data.gradient = gradient;
        next.data.objective = objective;
    }

    next.contributors = contributor_names(contributing);
    next.files = merge_files(&previous.files, contributing);
    next.error = None;
    next.unchanged = false;
    let snapshot = next.snapshot(overshoot);
    next.history.push(snapshot);
    next.iterate = next.history.len() < next.max_iterations;

    let outcome = RoundOutcome {
        round: next.history.len(),
        overshoot,
    };
    Ok((next, outcome))
}

/// Model features plus every feature any site reported.
fn feature_set(previous: &AggregateDocument, results: &[(&str, MultiShotResult)]) -> BTreeSet<String> {
    let mut features: BTreeSet<String> = previous.data.m_vals.keys().cloned().collect();
    for (_, result) in results {
        features.extend(result.gradient.keys().cloned());
    }
    features
}

/// Column-wise sums; every site must report every feature.
fn sum_contributions(
    features: &BTreeSet<String>,
    results: &[(&str, MultiShotResult)],
) -> Result<(f64, FeatureMap)> {
    let mut objective = 0.0;
    let mut gradient: FeatureMap = features.iter().map(|f| (f.clone(), 0.0)).collect();

    for (username, result) in results {
        if !result.objective.is_finite() {
            return Err(AggregateError::NonNumeric {
                username: username.to_string(),
                feature: "objective".into(),
            });
        }
        objective += result.objective;

        for (feature, total) in gradient.iter_mut() {
            let value = *result.gradient.get(feature).ok_or_else(|| {
                AggregateError::FeatureNotFound {
                    username: username.to_string(),
                    feature: feature.clone(),
                }
            })?;
            if !value.is_finite() {
                return Err(AggregateError::NonNumeric {
                    username: username.to_string(),
                    feature: feature.clone(),
                });
            }
            *total += value;
        }
    }

    Ok((objective, gradient))
}

/// `origin - rate * direction`, feature by feature.
fn step(features: &BTreeSet<String>, origin: &FeatureMap, direction: &FeatureMap, rate: f64) -> FeatureMap {
    features
        .iter()
        .map(|f| {
            let x = origin.get(f).copied().unwrap_or(0.0);
            let g = direction.get(f).copied().unwrap_or(0.0);
            (f.clone(), x - rate * g)
        })
        .collect()
}

pub(crate) fn merge_files(existing: &[String], contributing: &[AnalysisDocument]) -> Vec<String> {
    existing
        .iter()
        .chain(contributing.iter().flat_map(|a| a.file_shas.iter()))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AggregateSeed, Consortium};
    use proptest::prelude::*;
    use serde_json::json;

    fn seeded(client_count: usize, m: f64) -> AggregateDocument {
        let seed = AggregateSeed {
            learning_rate: 0.5,
            m_vals: [("x".to_string(), m)].into_iter().collect(),
            ..Default::default()
        };
        AggregateDocument::seed(&Consortium::new("study", client_count), &seed).unwrap()
    }

    fn site(user: &str, round: usize, objective: f64, grad: f64, r2: f64) -> AnalysisDocument {
        AnalysisDocument::new(
            user,
            round,
            json!({"objective": objective, "gradient": {"x": grad}, "r2": r2}),
        )
        .with_files(vec![format!("{}-file", user)])
    }

    #[test]
    fn first_round_is_accepted() {
        let agg = seeded(2, 1.0);
        let round = vec![site("alice", 1, 3.0, 0.5, 0.4), site("bob", 1, 2.0, 1.5, 0.8)];

        let (next, outcome) = recompute(&agg, &round).unwrap();

        assert!(!outcome.overshoot);
        assert_eq!(outcome.round, 1);
        assert_eq!(next.data.objective, 5.0);
        assert_eq!(next.data.gradient["x"], 2.0);
        // 1.0 - 0.5 * 2.0
        assert_eq!(next.data.m_vals["x"], 0.0);
        assert_eq!(next.data.previous_m_vals, next.data.m_vals);
        assert!((next.data.r2 - 0.6).abs() < 1e-12);
        assert_eq!(next.contributors, vec!["alice", "bob"]);
        assert_eq!(next.files, vec!["alice-file", "bob-file"]);
        assert_eq!(next.history.len(), 1);
        assert!(next.iterate);
        assert!(next.error.is_none());
    }

    #[test]
    fn worse_objective_halves_learning_rate() {
        let agg = seeded(2, 1.0);
        let round1 = vec![site("alice", 1, 3.0, 0.5, 0.4), site("bob", 1, 2.0, 1.5, 0.8)];
        let (after1, _) = recompute(&agg, &round1).unwrap();

        let round2 = vec![site("alice", 2, 4.0, 9.0, 0.1), site("bob", 2, 4.0, 9.0, 0.1)];
        let (after2, outcome) = recompute(&after1, &round2).unwrap();

        assert!(outcome.overshoot);
        assert_eq!(after2.data.learning_rate, after1.data.learning_rate / 2.0);
        // Objective and gradient stay at round 1's values
        assert_eq!(after2.data.objective, after1.data.objective);
        assert_eq!(after2.data.gradient, after1.data.gradient);
        assert_eq!(after2.data.previous_m_vals, after1.data.m_vals);
        // Step retaken from the last accepted point: 0.0 - 0.25 * 2.0
        assert_eq!(after2.data.m_vals["x"], -0.5);
        assert_eq!(after2.history.len(), 2);
        assert!(after2.history[1].overshoot);
    }

    #[test]
    fn equal_objective_counts_as_overshoot() {
        let agg = seeded(1, 0.0);
        let (after1, _) = recompute(&agg, &[site("a", 1, 1.0, 1.0, 0.0)]).unwrap();
        let (_, outcome) = recompute(&after1, &[site("a", 2, 1.0, 1.0, 0.0)]).unwrap();
        assert!(outcome.overshoot);
    }

    #[test]
    fn improvement_after_overshoot_resumes_from_evaluated_point() {
        let agg = seeded(1, 1.0);
        let (r1, _) = recompute(&agg, &[site("a", 1, 5.0, 2.0, 0.0)]).unwrap();
        let (r2, _) = recompute(&r1, &[site("a", 2, 9.0, 0.0, 0.0)]).unwrap();
        let (r3, outcome) = recompute(&r2, &[site("a", 3, 1.0, 1.0, 0.0)]).unwrap();

        assert!(!outcome.overshoot);
        // -0.5 - 0.25 * 1.0
        assert_eq!(r3.data.m_vals["x"], -0.75);
        assert_eq!(r3.data.previous_m_vals, r3.data.m_vals);
        assert_eq!(r3.data.learning_rate, r2.data.learning_rate);
        assert_eq!(r3.data.objective, 1.0);
    }

    #[test]
    fn accepted_round_advances_previous_values() {
        let agg = seeded(1, 1.0);
        let (next, outcome) = recompute(&agg, &[site("a", 1, 4.0, 2.0, 0.0)]).unwrap();

        assert!(!outcome.overshoot);
        assert_eq!(next.data.m_vals["x"], 0.0);
        assert_eq!(next.data.previous_m_vals, next.data.m_vals);
    }

    #[test]
    fn rejects_more_analyses_than_clients() {
        let agg = seeded(1, 0.0);
        let round = vec![site("alice", 1, 1.0, 1.0, 0.0), site("bob", 1, 1.0, 1.0, 0.0)];
        assert_eq!(
            recompute(&agg, &round).unwrap_err(),
            AggregateError::TooManyAnalyses {
                expected: 1,
                actual: 2
            }
        );
    }

    #[test]
    fn rejects_incomplete_round() {
        let agg = seeded(2, 0.0);
        assert!(matches!(
            recompute(&agg, &[site("alice", 1, 1.0, 1.0, 0.0)]),
            Err(AggregateError::IncompleteRound { .. })
        ));
    }

    #[test]
    fn missing_gradient_feature_names_site() {
        let agg = seeded(2, 0.0);
        let round = vec![
            site("alice", 1, 1.0, 1.0, 0.0),
            AnalysisDocument::new(
                "bob",
                1,
                json!({"objective": 1.0, "gradient": {"y": 1.0}, "r2": 0.0}),
            ),
        ];
        let err = recompute(&agg, &round).unwrap_err();
        assert_eq!(err.to_string(), "feature not found for alice: y");
    }

    #[test]
    fn iteration_cap_clears_iterate() {
        let mut agg = seeded(1, 0.0);
        agg.max_iterations = 2;
        let (r1, _) = recompute(&agg, &[site("a", 1, 3.0, 1.0, 0.0)]).unwrap();
        assert!(r1.iterate);
        let (r2, _) = recompute(&r1, &[site("a", 2, 2.0, 1.0, 0.0)]).unwrap();
        assert!(!r2.iterate);
    }

    #[test]
    fn deterministic() {
        let agg = seeded(2, 1.0);
        let round = vec![site("alice", 1, 3.0, 0.5, 0.4), site("bob", 1, 2.0, 1.5, 0.8)];
        assert_eq!(recompute(&agg, &round).unwrap(), recompute(&agg, &round).unwrap());
    }

    proptest! {
        #[test]
        fn history_grows_and_rate_never_increases(
            objectives in prop::collection::vec(0.0f64..100.0, 1..20),
            grads in prop::collection::vec(-10.0f64..10.0, 20),
        ) {
            let mut agg = seeded(1, 0.0);
            for (i, objective) in objectives.iter().enumerate() {
                let before_len = agg.history.len();
                let before_rate = agg.data.learning_rate;
                let analysis = site("a", agg.open_round(), *objective, grads[i], 0.5);

                let (next, outcome) = recompute(&agg, &[analysis]).unwrap();

                prop_assert_eq!(next.history.len(), before_len + 1);
                prop_assert!(next.data.learning_rate <= before_rate);
                if outcome.overshoot {
                    prop_assert_eq!(next.data.learning_rate, before_rate / 2.0);
                } else {
                    prop_assert_eq!(next.data.objective, *objective);
                }
                agg = next;
            }
        }
    }
}
