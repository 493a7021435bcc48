//! Node configuration.

use consortium_aggregate::{AggregateSeed, SingleShotPolicy};
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::registry::DEFAULT_STORE_PREFIX;

/// Storage backend for consortium stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    RocksDb,
    Memory,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rocksdb" | "rocks" => Ok(Backend::RocksDb),
            "memory" | "mem" => Ok(Backend::Memory),
            other => Err(Error::Config(format!("unknown backend: {}", other))),
        }
    }
}

/// Configuration for a consortium node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Root directory for RocksDB stores
    pub data_dir: PathBuf,
    pub backend: Backend,
    /// Prefix prepended to every store name
    pub store_prefix: String,
    /// Consortia opened at startup
    pub consortium_ids: Vec<String>,
    /// Client count used when provisioning `consortium_ids`
    pub client_count: usize,
    /// Seed for new aggregates
    pub seed: AggregateSeed,
    pub policy: SingleShotPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./consortium-data"),
            backend: Backend::default(),
            store_prefix: DEFAULT_STORE_PREFIX.to_string(),
            consortium_ids: Vec::new(),
            client_count: 1,
            seed: AggregateSeed::default(),
            policy: SingleShotPolicy::default(),
        }
    }
}

fn parse<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| Error::Config(format!("invalid {}={:?}: {}", key, raw, e)))
}

impl NodeConfig {
    /// Create config from environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(dir) = lookup("CONSORTIUM_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(backend) = lookup("CONSORTIUM_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Some(prefix) = lookup("CONSORTIUM_STORE_PREFIX") {
            config.store_prefix = prefix;
        }
        if let Some(ids) = lookup("CONSORTIUM_IDS") {
            config.consortium_ids = ids
                .split(',')
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect();
        }
        if let Some(raw) = lookup("CONSORTIUM_CLIENT_COUNT") {
            config.client_count = parse("CONSORTIUM_CLIENT_COUNT", &raw)?;
        }
        if let Some(raw) = lookup("CONSORTIUM_LEARNING_RATE") {
            config.seed.learning_rate = parse("CONSORTIUM_LEARNING_RATE", &raw)?;
        }
        if let Some(raw) = lookup("CONSORTIUM_LAMBDA") {
            config.seed.lambda = parse("CONSORTIUM_LAMBDA", &raw)?;
        }
        if let Some(raw) = lookup("CONSORTIUM_MAX_ITERATIONS") {
            config.seed.max_iterations = parse("CONSORTIUM_MAX_ITERATIONS", &raw)?;
        }
        if let Some(path) = lookup("CONSORTIUM_SINGLE_SHOT_POLICY") {
            let raw = std::fs::read_to_string(&path)?;
            config.policy = serde_json::from_str(&raw)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_count == 0 {
            return Err(Error::Config("client count must be at least 1".into()));
        }
        if !(self.seed.learning_rate.is_finite() && self.seed.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning rate must be positive, got {}",
                self.seed.learning_rate
            )));
        }
        self.policy
            .validate()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use consortium_aggregate::NoiseMode;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = NodeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.backend, Backend::RocksDb);
        assert_eq!(config.store_prefix, "consortium-");
        assert_eq!(config.seed.learning_rate, 0.1);
        assert_eq!(config.seed.max_iterations, 100);
        assert!(config.consortium_ids.is_empty());
    }

    #[test]
    fn overrides() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("CONSORTIUM_BACKEND", "memory"),
            ("CONSORTIUM_IDS", "study-a, study-b,,"),
            ("CONSORTIUM_CLIENT_COUNT", "3"),
            ("CONSORTIUM_LEARNING_RATE", "0.5"),
            ("CONSORTIUM_MAX_ITERATIONS", "7"),
        ]))
        .unwrap();
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.consortium_ids, vec!["study-a", "study-b"]);
        assert_eq!(config.client_count, 3);
        assert_eq!(config.seed.learning_rate, 0.5);
        assert_eq!(config.seed.max_iterations, 7);
    }

    #[test]
    fn bad_values_are_config_errors() {
        for vars in [
            [("CONSORTIUM_BACKEND", "postgres")],
            [("CONSORTIUM_CLIENT_COUNT", "many")],
            [("CONSORTIUM_CLIENT_COUNT", "0")],
            [("CONSORTIUM_LEARNING_RATE", "-1")],
        ] {
            assert!(matches!(
                NodeConfig::from_lookup(lookup(&vars)),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn policy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            r#"{"bounds": {"age": {"min": 0, "max": 120}}, "noise": "disabled"}"#,
        )
        .unwrap();

        let config = NodeConfig::from_lookup(lookup(&[(
            "CONSORTIUM_SINGLE_SHOT_POLICY",
            path.to_str().unwrap(),
        )]))
        .unwrap();
        assert_eq!(config.policy.noise, NoiseMode::Disabled);
        assert_eq!(config.policy.bounds["age"].max, 120.0);
    }
}
