//! Single-shot differentially private averaging.
//!
//! Every site submits one value per feature. The aggregate is the
//! column-wise mean plus Laplace noise scaled to `sensitivity / epsilon`,
//! with `sensitivity = (max - min) / sample_size` from configured bounds.

use crate::classify::{contributor_names, ensure_complete};
use crate::error::{AggregateError, Result};
use crate::model::{AggregateDocument, AnalysisDocument, FeatureMap};
use crate::multi_shot::{merge_files, RoundOutcome};
use crate::noise::Laplace;
use rand::distributions::Distribution;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Epsilon of the reference policy.
pub const DEFAULT_EPSILON: f64 = 1.0;

/// Known range of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureBounds {
    pub min: f64,
    pub max: f64,
}

impl FeatureBounds {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Sensitivity of the mean over `sample_size` sites.
    pub fn sensitivity(&self, sample_size: usize) -> f64 {
        (self.max - self.min) / sample_size as f64
    }
}

/// Whether noise is added to the released means.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseMode {
    #[default]
    Laplace,
    /// Release the exact mean (no privacy guarantee)
    Disabled,
}

fn default_epsilon() -> f64 {
    DEFAULT_EPSILON
}

/// Required features, their bounds, and the privacy budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleShotPolicy {
    #[serde(default)]
    pub bounds: BTreeMap<String, FeatureBounds>,
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    #[serde(default)]
    pub noise: NoiseMode,
}

impl Default for SingleShotPolicy {
    fn default() -> Self {
        Self {
            bounds: BTreeMap::new(),
            epsilon: DEFAULT_EPSILON,
            noise: NoiseMode::default(),
        }
    }
}

impl SingleShotPolicy {
    /// Builder: require a feature within `[min, max]`.
    pub fn with_feature(mut self, name: impl Into<String>, min: f64, max: f64) -> Self {
        self.bounds.insert(name.into(), FeatureBounds::new(min, max));
        self
    }

    /// Builder: set the noise mode.
    pub fn with_noise(mut self, noise: NoiseMode) -> Self {
        self.noise = noise;
        self
    }

    /// Check epsilon and bounds.
    pub fn validate(&self) -> Result<()> {
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(AggregateError::InvalidPolicy(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        for (feature, b) in &self.bounds {
            if !(b.min.is_finite() && b.max.is_finite() && b.min <= b.max) {
                return Err(AggregateError::InvalidPolicy(format!(
                    "bounds for {} are not an interval: [{}, {}]",
                    feature, b.min, b.max
                )));
            }
        }
        Ok(())
    }
}

/// Per-feature results of one averaging.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleShotSummary {
    /// Exact means
    pub means: FeatureMap,
    /// Sensitivity used per feature
    pub sensitivity: FeatureMap,
    /// Released values (means plus noise)
    pub released: FeatureMap,
}

/// Average the sites' feature values under `policy`.
pub fn average<R: Rng + ?Sized>(
    policy: &SingleShotPolicy,
    analyses: &[AnalysisDocument],
    rng: &mut R,
) -> Result<SingleShotSummary> {
    policy.validate()?;
    if policy.bounds.is_empty() {
        return Err(AggregateError::InvalidPolicy(
            "no features configured for single-shot averaging".into(),
        ));
    }
    if analyses.is_empty() {
        return Err(AggregateError::EmptyRound);
    }

    let mut sums: FeatureMap = policy.bounds.keys().map(|f| (f.clone(), 0.0)).collect();
    for analysis in analyses {
        for (feature, sum) in sums.iter_mut() {
            *sum += feature_value(analysis, feature)?;
        }
    }

    let n = analyses.len();
    let mut summary = SingleShotSummary {
        means: FeatureMap::new(),
        sensitivity: FeatureMap::new(),
        released: FeatureMap::new(),
    };
    for (feature, sum) in sums {
        let mean = sum / n as f64;
        let sensitivity = policy.bounds[&feature].sensitivity(n);
        let noise = match policy.noise {
            NoiseMode::Laplace => Laplace::calibrated(sensitivity, policy.epsilon)?.sample(rng),
            NoiseMode::Disabled => 0.0,
        };
        summary.released.insert(feature.clone(), mean + noise);
        summary.sensitivity.insert(feature.clone(), sensitivity);
        summary.means.insert(feature, mean);
    }
    Ok(summary)
}

fn feature_value(analysis: &AnalysisDocument, feature: &str) -> Result<f64> {
    let value = analysis
        .data
        .get(feature)
        .ok_or_else(|| AggregateError::FeatureNotFound {
            username: analysis.username.clone(),
            feature: feature.to_string(),
        })?;
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| AggregateError::NonNumeric {
            username: analysis.username.clone(),
            feature: feature.to_string(),
        })
}

/// Compute the single-shot aggregate: released means go into `data.mVals`,
/// one history snapshot is appended and iteration stops.
pub fn recompute<R: Rng + ?Sized>(
    previous: &AggregateDocument,
    contributing: &[AnalysisDocument],
    policy: &SingleShotPolicy,
    rng: &mut R,
) -> Result<(AggregateDocument, RoundOutcome)> {
    ensure_complete(contributing.len(), previous.client_count)?;
    let summary = average(policy, contributing, rng)?;

    let mut next = previous.clone();
    next.data.m_vals = summary.released;
    next.contributors = contributor_names(contributing);
    next.files = merge_files(&previous.files, contributing);
    next.error = None;
    next.unchanged = false;
    let snapshot = next.snapshot(false);
    next.history.push(snapshot);
    next.iterate = false;

    let outcome = RoundOutcome {
        round: next.history.len(),
        overshoot: false,
    };
    Ok((next, outcome))
}
