use std::env;
use std::fs;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ProtspaceError, Result};
use crate::reducer::ReducerParams;
use crate::style::{Hierarchy, StyleAssigner, StylePolicy};

pub const DEFAULT_CONFIG: &str = "protspace.toml";
pub const RANDOM_STATE_ENV: &str = "PROTSPACE_RANDOM_STATE";

/// Contents of `protspace.toml`.
///
/// ```toml
/// [reducer]
/// n_neighbors = 10
/// random_state = 7
///
/// [style]
/// cycle = "bounce"
///
/// [hierarchy.function]
/// levels = ["order", "family", "function"]
/// placements = { Toxin = { level = "order", group = "Toxin" } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtspaceConfig {
    pub reducer: ReducerParams,
    pub style: StylePolicy,
    pub hierarchy: IndexMap<String, Hierarchy>,
}

impl ProtspaceConfig {
    /// Reads `path`, falling back to defaults when the file does not exist.
    /// `PROTSPACE_RANDOM_STATE` takes precedence over the file's seed.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = fs::read_to_string(path)?;
            let config = Self::from_toml_str(&raw).map_err(|source| ProtspaceError::Config {
                path: path.to_path_buf(),
                source,
            })?;
            debug!(path = %path.display(), "loaded config");
            config
        } else {
            debug!(path = %path.display(), "config not found, using defaults");
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn validate(&self) -> Result<()> {
        self.reducer.validate()?;
        for (feature, hierarchy) in &self.hierarchy {
            hierarchy.validate(feature)?;
        }
        Ok(())
    }

    pub fn assigner(&self) -> StyleAssigner<'_> {
        StyleAssigner::new(&self.hierarchy, &self.style)
    }

    fn apply_env(&mut self) {
        if let Ok(raw) = env::var(RANDOM_STATE_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(seed) => self.reducer.random_state = seed,
                Err(_) => warn!(value = %raw, "ignoring non-numeric {RANDOM_STATE_ENV}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::style::CycleOrder;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProtspaceConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.style, StylePolicy::default());
        assert!(config.hierarchy.is_empty());
    }

    #[test]
    fn parses_sections() {
        let raw = r#"
            [reducer]
            n_neighbors = 5
            metric = "cosine"

            [style]
            cycle = "bounce"
            shades_per_family = 3

            [hierarchy.function]
            levels = ["order", "family"]
            placements = { Toxin = { level = "order", group = "Toxin" } }
        "#;
        let config = ProtspaceConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.reducer.n_neighbors, 5);
        assert_eq!(config.reducer.perplexity, 30.0);
        assert_eq!(config.style.cycle, CycleOrder::Bounce);
        assert_eq!(config.style.shades_per_family, 3);
        assert_eq!(config.hierarchy["function"].levels, vec!["order", "family"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("protspace.toml");
        fs::write(&path, "[reducer]\nn_neighbors = \"many\"\n").unwrap();
        let err = ProtspaceConfig::load(&path).unwrap_err();
        assert!(matches!(err, ProtspaceError::Config { .. }));
        assert!(err.to_string().contains("protspace.toml"));
    }

    #[test]
    fn rejects_unknown_sections() {
        assert!(ProtspaceConfig::from_toml_str("[plotting]\nwidth = 3\n").is_err());
    }
}
