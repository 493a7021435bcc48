//! Consortium, analysis and aggregate documents.
//!
//! Field names follow the stored JSON (`fileShas`, `mVals`, `learningRate`,
//! `clientCount`, ...). The initial objective is `+infinity`, which JSON
//! cannot carry, so it is written as `null` and read back as `+infinity`.

use crate::error::{AggregateError, Result};
use consortium_store::Document;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Id of the aggregate document in every consortium store.
pub const AGGREGATE_ID: &str = "aggregate";

/// Model values, gradients, etc., keyed by feature name.
pub type FeatureMap = BTreeMap<String, f64>;

/// Which aggregation path a consortium runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ComputationMode {
    /// Iterative ridge-regression style gradient descent
    #[default]
    MultiShot,
    /// One round of noised averaging
    SingleShot,
}

/// A multi-party computation instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consortium {
    /// Identifier (normalized into the store name)
    pub id: String,

    /// Display label
    #[serde(default)]
    pub label: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Declared analyses
    #[serde(default)]
    pub analyses: Vec<String>,

    /// Expected contributing sites per round
    pub client_count: usize,

    /// Replication URL of the consortium store
    #[serde(default)]
    pub db_url: Option<String>,

    #[serde(default)]
    pub mode: ComputationMode,
}

impl Consortium {
    /// Create a minimal consortium.
    pub fn new(id: impl Into<String>, client_count: usize) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            description: String::new(),
            tags: Vec::new(),
            analyses: Vec::new(),
            client_count,
            db_url: None,
            mode: ComputationMode::default(),
        }
    }

    /// Builder: set the computation mode.
    pub fn with_mode(mut self, mode: ComputationMode) -> Self {
        self.mode = mode;
        self
    }
}

/// One client's partial result for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisDocument {
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Owning client
    pub username: String,

    /// Content-addressed ids of the files this analysis used
    #[serde(default)]
    pub file_shas: Vec<String>,

    /// Only the length matters: it is the round this analysis belongs to
    #[serde(default)]
    pub history: Vec<Value>,

    /// `{objective, gradient, r2}` for multi-shot, `{feature: value}` for single-shot
    #[serde(default)]
    pub data: Value,
}

impl AnalysisDocument {
    /// Create an analysis for the given round (its history length).
    pub fn new(username: impl Into<String>, round: usize, data: Value) -> Self {
        Self {
            id: String::new(),
            rev: None,
            username: username.into(),
            file_shas: Vec::new(),
            history: vec![Value::Null; round],
            data,
        }
    }

    /// Builder: set contributed file ids.
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.file_shas = files;
        self
    }

    /// Round this analysis belongs to.
    pub fn round(&self) -> usize {
        self.history.len()
    }

    /// Read `data` as a multi-shot result.
    pub fn multi_shot(&self) -> Result<MultiShotResult> {
        serde_json::from_value(self.data.clone()).map_err(|e| AggregateError::MalformedDocument {
            id: self.id.clone(),
            reason: format!("{} (from {})", e, self.username),
        })
    }

    pub fn to_document(&self) -> Result<Document> {
        Document::from_typed(self).map_err(|e| AggregateError::MalformedDocument {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }
}

/// A site's multi-shot contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultiShotResult {
    pub objective: f64,
    #[serde(default)]
    pub gradient: FeatureMap,
    #[serde(default)]
    pub r2: f64,
}

mod objective {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            s.serialize_f64(*value)
        } else {
            s.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::INFINITY))
    }

    pub fn initial() -> f64 {
        f64::INFINITY
    }
}

/// Model state carried by the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateData {
    /// Current model value per feature
    #[serde(rename = "mVals", default)]
    pub m_vals: FeatureMap,

    /// Aggregate objective of the last accepted round
    #[serde(with = "objective", default = "objective::initial")]
    pub objective: f64,

    /// Aggregate gradient of the last accepted round
    #[serde(default)]
    pub gradient: FeatureMap,

    pub learning_rate: f64,

    /// Mean r² across contributing sites
    #[serde(default)]
    pub r2: f64,

    /// Model values at which `gradient` was evaluated
    #[serde(rename = "previousMVals", default)]
    pub previous_m_vals: FeatureMap,
}

impl AggregateData {
    /// Whether no round has been accepted yet.
    pub fn is_initial(&self) -> bool {
        !self.objective.is_finite()
    }
}

/// One completed round, as appended to the aggregate's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub contributors: Vec<String>,
    pub data: AggregateData,
    /// The round failed to improve the objective
    #[serde(default)]
    pub overshoot: bool,
}

/// Starting values for a new aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSeed {
    pub learning_rate: f64,
    pub lambda: f64,
    pub max_iterations: usize,
    #[serde(rename = "mVals", default)]
    pub m_vals: FeatureMap,
}

impl Default for AggregateSeed {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            lambda: 0.0,
            max_iterations: 100,
            m_vals: FeatureMap::new(),
        }
    }
}

/// The single mutable state document of a consortium store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateDocument {
    #[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    /// Always `true`; this is how the aggregate is told apart
    pub aggregate: bool,

    #[serde(default)]
    pub mode: ComputationMode,

    pub data: AggregateData,

    /// Ridge regularization constant handed to clients
    #[serde(default)]
    pub lambda: f64,

    pub max_iterations: usize,

    pub client_count: usize,

    /// Usernames of the latest round's submitters
    #[serde(default)]
    pub contributors: Vec<String>,

    /// Union of contributed file ids
    #[serde(default)]
    pub files: Vec<String>,

    /// Whether clients should run another round
    #[serde(default)]
    pub iterate: bool,

    /// Last recomputation error
    #[serde(default)]
    pub error: Option<String>,

    /// One snapshot per completed round
    #[serde(default)]
    pub history: Vec<AggregateSnapshot>,

    /// Set when a contributor refresh found nothing new; never persisted
    #[serde(skip)]
    pub unchanged: bool,
}

impl AggregateDocument {
    /// Seed the aggregate for a freshly created consortium store.
    pub fn seed(consortium: &Consortium, seed: &AggregateSeed) -> Result<Self> {
        if consortium.client_count == 0 {
            return Err(AggregateError::InvalidPolicy(format!(
                "consortium {} expects zero clients",
                consortium.id
            )));
        }
        if !(seed.learning_rate.is_finite() && seed.learning_rate > 0.0) {
            return Err(AggregateError::InvalidPolicy(format!(
                "learning rate must be positive, got {}",
                seed.learning_rate
            )));
        }

        Ok(Self {
            id: AGGREGATE_ID.to_string(),
            rev: None,
            aggregate: true,
            mode: consortium.mode,
            data: AggregateData {
                m_vals: seed.m_vals.clone(),
                objective: f64::INFINITY,
                gradient: FeatureMap::new(),
                learning_rate: seed.learning_rate,
                r2: 0.0,
                previous_m_vals: seed.m_vals.clone(),
            },
            lambda: seed.lambda,
            max_iterations: seed.max_iterations,
            client_count: consortium.client_count,
            contributors: Vec::new(),
            files: Vec::new(),
            iterate: true,
            error: None,
            history: Vec::new(),
            unchanged: false,
        })
    }

    /// History length an analysis must have to count toward the open round.
    pub fn open_round(&self) -> usize {
        self.history.len() + 1
    }

    /// Snapshot the current state for the history.
    pub fn snapshot(&self, overshoot: bool) -> AggregateSnapshot {
        AggregateSnapshot {
            files: self.files.clone(),
            contributors: self.contributors.clone(),
            data: self.data.clone(),
            overshoot,
        }
    }

    pub fn to_document(&self) -> Result<Document> {
        Document::from_typed(self).map_err(|e| AggregateError::MalformedDocument {
            id: self.id.clone(),
            reason: e.to_string(),
        })
    }

    pub fn from_document(doc: &Document) -> Result<Self> {
        doc.to_typed().map_err(|e| AggregateError::MalformedDocument {
            id: doc.id.clone(),
            reason: e.to_string(),
        })
    }
}
