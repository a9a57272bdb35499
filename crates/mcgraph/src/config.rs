//! Read-only flags consumed by the exploration core.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which causal view is saved as an event's prefix.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixViewPolicy {
    /// Program order union reads-from.
    #[default]
    Porf,
    /// Program order restricted to declared dependencies, union reads-from.
    Dependencies,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model out-of-order execution: enables split-after-hb placements and
    /// the extra coherence pruning of revisit candidates.
    pub out_of_order: bool,

    /// Accesses inside critical sections of the same lock never race.
    pub lock_discipline: bool,

    /// Invoke the persistency collaborator for disk labels.
    pub persevere: bool,

    pub prefix_view: PrefixViewPolicy,

    /// Stop after this many complete executions.
    pub max_executions: Option<u64>,

    /// Warn once a single graph grows past this many events.
    pub warn_on_graph_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            out_of_order: false,
            lock_discipline: false,
            persevere: false,
            prefix_view: PrefixViewPolicy::Porf,
            max_executions: None,
            warn_on_graph_size: 1024,
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.out_of_order && self.prefix_view != PrefixViewPolicy::Dependencies {
            return Err(Error::UnsupportedConfiguration(
                "out-of-order execution requires the dependencies prefix view".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.out_of_order);
        assert!(!config.lock_discipline);
        assert!(!config.persevere);
        assert_eq!(config.prefix_view, PrefixViewPolicy::Porf);
        assert_eq!(config.max_executions, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config = Config::from_json(r#"{"lock_discipline": true}"#).unwrap();
        assert!(config.lock_discipline);
        assert_eq!(config.warn_on_graph_size, 1024);
    }

    #[test]
    fn test_policy_names() {
        let config =
            Config::from_json(r#"{"prefix_view": "dependencies", "out_of_order": true}"#).unwrap();
        assert_eq!(config.prefix_view, PrefixViewPolicy::Dependencies);
        assert!(config.out_of_order);
    }

    #[test]
    fn test_out_of_order_requires_dependencies() {
        let err = Config::from_json(r#"{"out_of_order": true}"#).unwrap_err();
        assert!(matches!(err, Error::UnsupportedConfiguration(_)));
    }

    #[test]
    fn test_malformed_json() {
        let err = Config::from_json("{").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_internal());
    }
}
