//! Ensemble configuration
//!
//! Every hyperparameter lives here rather than in trainer code. A config is
//! read from TOML, then `ENSEMBLE_*` environment variables override selected
//! fields, and `validate` reports suspicious values as warnings.

use crate::errors::{EnsembleError, Result};
use crate::features::FeatureSet;
use crate::models::{DepthwiseParams, ForestParams, LeafwiseParams, ModelFamily, NeuralParams, ObliviousParams};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Holdout split settings shared by every trainer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SplitConfig {
    /// Share of races reserved for held-out evaluation
    pub validation_fraction: f64,
    pub seed: u64,
    /// Minimum training rows a family needs after the split
    pub min_train_rows: usize,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            seed: 42,
            min_train_rows: 30,
        }
    }
}

/// Full training configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EnsembleConfig {
    pub features: FeatureSet,
    pub split: SplitConfig,
    /// Families to train, in training order
    pub families: Vec<ModelFamily>,
    pub boosted_tree_a: LeafwiseParams,
    pub boosted_tree_b: DepthwiseParams,
    pub boosted_tree_c: ObliviousParams,
    pub random_forest: ForestParams,
    pub neural_net: NeuralParams,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            features: FeatureSet::default(),
            split: SplitConfig::default(),
            families: ModelFamily::ALL.to_vec(),
            boosted_tree_a: LeafwiseParams::default(),
            boosted_tree_b: DepthwiseParams::default(),
            boosted_tree_c: ObliviousParams::default(),
            random_forest: ForestParams::default(),
            neural_net: NeuralParams::default(),
        }
    }
}

impl EnsembleConfig {
    /// Small budgets for smoke runs and tests
    pub fn lightweight() -> Self {
        Self {
            boosted_tree_a: LeafwiseParams {
                n_rounds: 40,
                learning_rate: 0.1,
                num_leaves: 8,
                min_samples_leaf: 10,
                early_stopping_rounds: 10,
                ..LeafwiseParams::default()
            },
            boosted_tree_b: DepthwiseParams {
                n_rounds: 40,
                learning_rate: 0.1,
                max_depth: 3,
                early_stopping_rounds: 10,
                ..DepthwiseParams::default()
            },
            boosted_tree_c: ObliviousParams {
                n_rounds: 40,
                learning_rate: 0.1,
                depth: 4,
                max_bins: 32,
                early_stopping_rounds: 10,
                ..ObliviousParams::default()
            },
            random_forest: ForestParams {
                n_trees: 20,
                max_depth: 6,
                ..ForestParams::default()
            },
            neural_net: NeuralParams {
                hidden_layers: vec![16, 8],
                epochs: 15,
                batch_size: 64,
                learning_rate: 5e-3,
                patience: 4,
                ..NeuralParams::default()
            },
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = std::fs::read_to_string(path)?;
        let config: EnsembleConfig = toml::from_str(&content)
            .map_err(|e| EnsembleError::Configuration(format!("Failed to parse config: {e}")))?;
        config.features.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| EnsembleError::Serialization(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Apply `ENSEMBLE_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup; split out so tests need not touch the process environment
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(val) = lookup("ENSEMBLE_SEED") {
            self.split.seed = val
                .trim()
                .parse()
                .map_err(|_| EnsembleError::Configuration(format!("ENSEMBLE_SEED is not an integer: {val}")))?;
        }

        if let Some(val) = lookup("ENSEMBLE_VALIDATION_FRACTION") {
            self.split.validation_fraction = val.trim().parse().map_err(|_| {
                EnsembleError::Configuration(format!("ENSEMBLE_VALIDATION_FRACTION is not a number: {val}"))
            })?;
        }

        if let Some(val) = lookup("ENSEMBLE_FAMILIES") {
            self.families = parse_families(&val)?;
        }

        Ok(())
    }

    /// Hard errors for unusable settings, warnings for questionable ones
    pub fn validate(&self) -> Result<Vec<String>> {
        self.features.validate()?;

        if !(self.split.validation_fraction > 0.0 && self.split.validation_fraction < 1.0) {
            return Err(EnsembleError::Configuration(format!(
                "validation_fraction must be in (0, 1), got {}",
                self.split.validation_fraction
            )));
        }
        if self.families.is_empty() {
            return Err(EnsembleError::Configuration("no model families selected".to_string()));
        }
        let mut seen = self.families.clone();
        seen.sort_unstable();
        seen.dedup();
        if seen.len() != self.families.len() {
            return Err(EnsembleError::Configuration("model family listed twice".to_string()));
        }

        let mut warnings = Vec::new();

        if self.split.validation_fraction > 0.5 {
            warnings.push("More than half of the races are held out".to_string());
        }
        if !self.families.contains(&ModelFamily::GUARANTEED) {
            warnings.push(format!(
                "{} is not selected; it is the fallback family when no AUC is usable",
                ModelFamily::GUARANTEED
            ));
        }
        if self.boosted_tree_a.early_stopping_rounds == 0
            || self.boosted_tree_b.early_stopping_rounds == 0
            || self.boosted_tree_c.early_stopping_rounds == 0
        {
            warnings.push("Early stopping disabled for a boosted family".to_string());
        }
        if self.random_forest.n_trees < 10 {
            warnings.push("Random forest has fewer than 10 trees".to_string());
        }
        if self.neural_net.grad_clip <= 0.0 {
            warnings.push("Gradient clipping is disabled for the neural network".to_string());
        }

        if warnings.is_empty() {
            info!("Configuration validation passed");
        } else {
            warn!("Configuration validation warnings: {:?}", warnings);
        }

        Ok(warnings)
    }
}

/// Parse a comma-separated family list such as `boosted_tree_a,neural_net`
pub fn parse_families(list: &str) -> Result<Vec<ModelFamily>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let warnings = EnsembleConfig::default().validate().unwrap();
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(EnsembleConfig::default().families.len(), 5);
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ensemble.toml");
        let config = EnsembleConfig::lightweight();
        config.save_to_file(&path).unwrap();
        let loaded = EnsembleConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: EnsembleConfig = toml::from_str(
            r#"
            families = ["boosted_tree_a", "random_forest"]

            [split]
            seed = 7

            [random_forest]
            n_trees = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.families, vec![ModelFamily::BoostedTreeA, ModelFamily::RandomForest]);
        assert_eq!(config.split.seed, 7);
        assert_eq!(config.split.validation_fraction, 0.2);
        assert_eq!(config.random_forest.n_trees, 50);
        assert_eq!(config.random_forest.max_depth, ForestParams::default().max_depth);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ENSEMBLE_SEED", "99"),
            ("ENSEMBLE_VALIDATION_FRACTION", "0.25"),
            ("ENSEMBLE_FAMILIES", "neural_net, boosted_tree_b"),
        ]
        .into_iter()
        .collect();
        let mut config = EnsembleConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.split.seed, 99);
        assert_eq!(config.split.validation_fraction, 0.25);
        assert_eq!(config.families, vec![ModelFamily::NeuralNet, ModelFamily::BoostedTreeB]);
    }

    #[test]
    fn test_bad_env_value_is_rejected() {
        let mut config = EnsembleConfig::default();
        let result = config.apply_overrides(|k| (k == "ENSEMBLE_FAMILIES").then(|| "gbdt".to_string()));
        assert!(matches!(result, Err(EnsembleError::Configuration(_))));
    }

    #[test]
    fn test_validate_rejects_bad_fraction_and_warns() {
        let mut config = EnsembleConfig::default();
        config.split.validation_fraction = 1.0;
        assert!(config.validate().is_err());

        let mut config = EnsembleConfig::default();
        config.families = vec![ModelFamily::NeuralNet];
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 1);

        config.families = vec![ModelFamily::NeuralNet, ModelFamily::NeuralNet];
        assert!(config.validate().is_err());
    }
}
