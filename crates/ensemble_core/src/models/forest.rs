//! Bagged decision trees (`random_forest`)
//!
//! Each tree is grown on a bootstrap sample with a random subset of columns
//! considered at every split. With `g = -y`, `h = 1` and no regularisation the
//! CART gain is the reduction in squared error, which for 0/1 labels ranks
//! splits exactly as Gini impurity does, and a leaf value is the positive rate
//! of its rows. Trees are grown in parallel from per-tree seeds, so the
//! result does not depend on thread scheduling.

use super::cart::{BinnedData, CartBuilder, CategoricalSplit, TreeConfig};
use super::tree::Tree;
use super::{Classifier, FamilyTrainer, FittedModel, ModelFamily, Prepared};
use crate::config::SplitConfig;
use crate::deterministic::{hash_words, LcgRng};
use crate::errors::{EnsembleError, Result};
use crate::features::FeatureSet;
use crate::frame::Frame;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

/// Fitted forest; the probability is the mean leaf rate across trees
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RandomForest {
    pub columns: Vec<String>,
    pub trees: Vec<Tree>,
}

impl RandomForest {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.trees.is_empty() {
            return Err("forest has no trees".to_string());
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(self.columns.len())
                .map_err(|e| format!("tree {i}: {e}"))?;
        }
        Ok(())
    }
}

impl Classifier for RandomForest {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        if self.trees.is_empty() {
            return 0.5;
        }
        let total: f64 = self.trees.iter().map(|t| t.evaluate(row)).sum();
        (total / self.trees.len() as f64).clamp(0.0, 1.0)
    }
}

/// How many columns each split may look at
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum MaxFeatures {
    Sqrt,
    Log2,
    All,
    Fraction(f64),
}

impl MaxFeatures {
    pub fn resolve(&self, n_features: usize) -> usize {
        let n = n_features as f64;
        let k = match self {
            MaxFeatures::Sqrt => n.sqrt().floor(),
            MaxFeatures::Log2 => n.log2().floor(),
            MaxFeatures::All => n,
            MaxFeatures::Fraction(f) => (n * f).floor(),
        };
        (k as usize).clamp(1, n_features.max(1))
    }
}

/// Parameters for `random_forest`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForestParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
    pub max_bins: usize,
    pub seed: u64,
}

impl Default for ForestParams {
    fn default() -> Self {
        Self {
            n_trees: 200,
            max_depth: 10,
            min_samples_leaf: 5,
            max_features: MaxFeatures::Sqrt,
            bootstrap: true,
            max_bins: 255,
            seed: 42,
        }
    }
}

pub struct RandomForestTrainer {
    params: ForestParams,
    split: SplitConfig,
}

impl RandomForestTrainer {
    pub fn new(params: ForestParams, split: SplitConfig) -> Self {
        Self { params, split }
    }
}

impl FamilyTrainer for RandomForestTrainer {
    fn family(&self) -> ModelFamily {
        ModelFamily::RandomForest
    }

    #[instrument(skip_all, fields(family = "random_forest"))]
    fn train(&self, frame: &Frame, labels: &[u8], features: &FeatureSet) -> Result<(FittedModel, f64)> {
        let family = self.family();
        let p = &self.params;
        if p.n_trees == 0 || p.max_depth == 0 {
            return Err(EnsembleError::training(family, "n_trees and max_depth must be > 0"));
        }
        let prepared = Prepared::new(family, frame, labels, features, &self.split)?;

        let data = BinnedData::from_rows(&prepared.train_rows, &prepared.categorical, p.max_bins);
        let targets: Vec<f64> = prepared.train_labels.iter().map(|&y| -f64::from(y)).collect();
        let hessians = vec![1.0; targets.len()];
        let config = TreeConfig {
            max_depth: p.max_depth,
            min_samples_leaf: p.min_samples_leaf,
            categorical_split: CategoricalSplit::OneVsRest,
            features_per_split: Some(p.max_features.resolve(prepared.columns.len())),
            ..TreeConfig::default()
        };

        let n = prepared.train_rows.len();
        let trees: Vec<Tree> = (0..p.n_trees)
            .into_par_iter()
            .map(|t| {
                let mut rng = LcgRng::new(hash_words(&[t as u64], p.seed));
                let rows: Vec<usize> = if p.bootstrap {
                    (0..n).map(|_| rng.next_range(n)).collect()
                } else {
                    (0..n).collect()
                };
                CartBuilder::new(&config, &data, &targets, &hessians).build(rows, &mut rng)
            })
            .collect();

        let model = RandomForest {
            columns: prepared.columns.clone(),
            trees,
        };
        let auc = prepared.holdout_auc(family, &model)?;
        info!(trees = model.trees.len(), auc, "trained random_forest");
        Ok((FittedModel::RandomForest(model), auc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tree::Node;

    #[test]
    fn test_max_features_resolution() {
        assert_eq!(MaxFeatures::Sqrt.resolve(28), 5);
        assert_eq!(MaxFeatures::Log2.resolve(28), 4);
        assert_eq!(MaxFeatures::All.resolve(28), 28);
        assert_eq!(MaxFeatures::Fraction(0.5).resolve(28), 14);
        assert_eq!(MaxFeatures::Fraction(0.0).resolve(28), 1);
    }

    #[test]
    fn test_forest_averages_trees() {
        let stump = |left: f64, right: f64| {
            Tree::new(vec![
                Node::internal(0, 0, 0.5, 1, 2),
                Node::leaf(1, left),
                Node::leaf(2, right),
            ])
        };
        let forest = RandomForest {
            columns: vec!["x".to_string()],
            trees: vec![stump(0.0, 1.0), stump(0.2, 0.6)],
        };
        assert!((forest.predict_row(&[0.0]) - 0.1).abs() < 1e-12);
        assert!((forest.predict_row(&[1.0]) - 0.8).abs() < 1e-12);
        assert!(forest.validate().is_ok());
    }

    #[test]
    fn test_empty_forest_is_invalid() {
        let forest = RandomForest {
            columns: vec!["x".to_string()],
            trees: vec![],
        };
        assert!(forest.validate().is_err());
    }
}
