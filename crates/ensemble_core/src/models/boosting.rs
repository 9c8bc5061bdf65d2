//! Gradient boosted trees on the logistic loss
//!
//! Two families share [`BoostedTrees`] as their fitted form and differ in how
//! the trees are grown:
//! - `boosted_tree_a`: leaf-wise growth under a leaf budget, categorical
//!   columns split on gradient-sorted category sets
//! - `boosted_tree_b`: depth-wise growth with L2 and split-penalty
//!   regularisation, categorical columns split one category at a time
//!
//! The learning rate is folded into leaf values, so inference is
//! `sigmoid(base_score + Σ tree(row))`.

use super::cart::{BinnedData, CartBuilder, CategoricalSplit, TreeConfig};
use super::tree::Tree;
use super::{sigmoid, Classifier, FamilyTrainer, FittedModel, ModelFamily, Prepared};
use crate::config::SplitConfig;
use crate::deterministic::LcgRng;
use crate::errors::{EnsembleError, Result};
use crate::features::FeatureSet;
use crate::frame::Frame;
use crate::metrics::log_loss;
use crate::serde_canon::{ensure_finite, CanonicalError};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

/// Fitted additive tree model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BoostedTrees {
    pub columns: Vec<String>,
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

impl BoostedTrees {
    pub fn new(columns: Vec<String>, base_score: f64, trees: Vec<Tree>) -> Self {
        Self {
            columns,
            base_score,
            trees,
        }
    }

    pub fn raw_score(&self, row: &[f64]) -> f64 {
        self.base_score + self.trees.iter().map(|t| t.evaluate(row)).sum::<f64>()
    }

    pub(crate) fn ensure_finite(&self) -> std::result::Result<(), CanonicalError> {
        ensure_finite(
            "boosted trees",
            std::iter::once(self.base_score).chain(self.trees.iter().flat_map(Tree::values)),
        )
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(self.columns.len())
                .map_err(|e| format!("tree {i}: {e}"))?;
        }
        Ok(())
    }
}

impl Classifier for BoostedTrees {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        sigmoid(self.raw_score(row))
    }
}

/// Boosting schedule shared by every boosted family
#[derive(Debug, Clone)]
pub(crate) struct BoostSchedule {
    pub n_rounds: usize,
    pub subsample: f64,
    pub early_stopping_rounds: usize,
    pub seed: u64,
}

/// A tree that adds a raw score for one row
pub(crate) trait ScoreTree {
    fn score(&self, row: &[f64]) -> f64;
}

impl ScoreTree for Tree {
    fn score(&self, row: &[f64]) -> f64 {
        self.evaluate(row)
    }
}

/// Fitted boosting state: starting score and the kept trees
pub(crate) struct Boosted<T> {
    pub base_score: f64,
    pub trees: Vec<T>,
    pub best_loss: f64,
}

/// Log-odds of the positive rate, clamped away from the degenerate ends
pub(crate) fn initial_score(labels: &[u8]) -> f64 {
    let positives = labels.iter().filter(|&&y| y == 1).count() as f64;
    let rate = (positives / labels.len().max(1) as f64).clamp(1e-6, 1.0 - 1e-6);
    (rate / (1.0 - rate)).ln()
}

/// Run logistic boosting rounds with early stopping on holdout log-loss.
///
/// `grow` receives the sampled positions and per-position gradients and
/// hessians of the training rows. The returned trees are truncated to the
/// round with the lowest holdout loss.
pub(crate) fn run_boosting<T: ScoreTree>(
    train_rows: &[Vec<f64>],
    train_labels: &[u8],
    valid_rows: &[Vec<f64>],
    valid_labels: &[u8],
    schedule: &BoostSchedule,
    mut grow: impl FnMut(Vec<usize>, &[f64], &[f64], &mut LcgRng) -> T,
) -> Boosted<T> {
    let base_score = initial_score(train_labels);
    let mut train_scores = vec![base_score; train_rows.len()];
    let mut valid_scores = vec![base_score; valid_rows.len()];
    let mut gradients = vec![0.0; train_rows.len()];
    let mut hessians = vec![0.0; train_rows.len()];
    let mut rng = LcgRng::new(schedule.seed);

    let mut trees = Vec::with_capacity(schedule.n_rounds);
    let valid_probs = |scores: &[f64]| scores.iter().map(|&s| sigmoid(s)).collect::<Vec<_>>();
    let mut best_loss = log_loss(valid_labels, &valid_probs(&valid_scores));
    let mut best_len = 0usize;

    for round in 0..schedule.n_rounds {
        for i in 0..train_rows.len() {
            let p = sigmoid(train_scores[i]);
            gradients[i] = p - f64::from(train_labels[i]);
            hessians[i] = (p * (1.0 - p)).max(1e-16);
        }

        let sampled: Vec<usize> = if schedule.subsample < 1.0 {
            let picked: Vec<usize> = (0..train_rows.len())
                .filter(|_| rng.next_f64() < schedule.subsample)
                .collect();
            if picked.is_empty() {
                (0..train_rows.len()).collect()
            } else {
                picked
            }
        } else {
            (0..train_rows.len()).collect()
        };

        let tree = grow(sampled, &gradients, &hessians, &mut rng);
        for (score, row) in train_scores.iter_mut().zip(train_rows) {
            *score += tree.score(row);
        }
        for (score, row) in valid_scores.iter_mut().zip(valid_rows) {
            *score += tree.score(row);
        }
        trees.push(tree);

        let loss = log_loss(valid_labels, &valid_probs(&valid_scores));
        if loss < best_loss {
            best_loss = loss;
            best_len = trees.len();
        } else if schedule.early_stopping_rounds > 0 && trees.len() - best_len >= schedule.early_stopping_rounds {
            debug!(round, best_len, "early stopping");
            break;
        }
    }

    trees.truncate(best_len);
    Boosted {
        base_score,
        trees,
        best_loss,
    }
}

/// Grow CART trees with `config` on binned training rows
fn fit_cart_boosting(
    prepared: &Prepared,
    config: TreeConfig,
    max_bins: usize,
    schedule: &BoostSchedule,
) -> (BoostedTrees, f64) {
    let data = BinnedData::from_rows(&prepared.train_rows, &prepared.categorical, max_bins);
    let boosted = run_boosting(
        &prepared.train_rows,
        &prepared.train_labels,
        &prepared.valid_rows,
        &prepared.valid_labels,
        schedule,
        |rows, g, h, rng| CartBuilder::new(&config, &data, g, h).build(rows, rng),
    );
    let model = BoostedTrees::new(prepared.columns.clone(), boosted.base_score, boosted.trees);
    (model, boosted.best_loss)
}

/// Parameters for leaf-wise boosting (`boosted_tree_a`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LeafwiseParams {
    pub n_rounds: usize,
    pub learning_rate: f64,
    pub num_leaves: usize,
    pub max_depth: usize,
    pub min_samples_leaf: usize,
    pub lambda: f64,
    pub bagging_fraction: f64,
    pub max_bins: usize,
    pub early_stopping_rounds: usize,
    pub seed: u64,
}

impl Default for LeafwiseParams {
    fn default() -> Self {
        Self {
            n_rounds: 300,
            learning_rate: 0.05,
            num_leaves: 31,
            max_depth: 12,
            min_samples_leaf: 20,
            lambda: 0.0,
            bagging_fraction: 0.8,
            max_bins: 255,
            early_stopping_rounds: 30,
            seed: 42,
        }
    }
}

pub struct LeafwiseBoostTrainer {
    params: LeafwiseParams,
    split: SplitConfig,
}

impl LeafwiseBoostTrainer {
    pub fn new(params: LeafwiseParams, split: SplitConfig) -> Self {
        Self { params, split }
    }
}

impl FamilyTrainer for LeafwiseBoostTrainer {
    fn family(&self) -> ModelFamily {
        ModelFamily::BoostedTreeA
    }

    #[instrument(skip_all, fields(family = "boosted_tree_a"))]
    fn train(&self, frame: &Frame, labels: &[u8], features: &FeatureSet) -> Result<(FittedModel, f64)> {
        let family = self.family();
        let p = &self.params;
        if p.num_leaves < 2 || p.learning_rate <= 0.0 {
            return Err(EnsembleError::training(family, "num_leaves must be >= 2 and learning_rate > 0"));
        }
        let prepared = Prepared::new(family, frame, labels, features, &self.split)?;

        let config = TreeConfig {
            max_depth: p.max_depth,
            max_leaves: Some(p.num_leaves),
            min_samples_leaf: p.min_samples_leaf,
            lambda: p.lambda,
            categorical_split: CategoricalSplit::GradientSorted,
            leaf_scale: p.learning_rate,
            ..TreeConfig::default()
        };
        let schedule = BoostSchedule {
            n_rounds: p.n_rounds,
            subsample: p.bagging_fraction,
            early_stopping_rounds: p.early_stopping_rounds,
            seed: p.seed,
        };
        let (model, loss) = fit_cart_boosting(&prepared, config, p.max_bins, &schedule);
        let auc = prepared.holdout_auc(family, &model)?;
        info!(trees = model.trees.len(), holdout_log_loss = loss, auc, "trained boosted_tree_a");
        Ok((FittedModel::BoostedTreeA(model), auc))
    }
}

/// Parameters for depth-wise boosting (`boosted_tree_b`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DepthwiseParams {
    pub n_rounds: usize,
    pub learning_rate: f64,
    pub max_depth: usize,
    pub min_child_weight: f64,
    pub lambda: f64,
    pub gamma: f64,
    pub subsample: f64,
    pub max_bins: usize,
    pub early_stopping_rounds: usize,
    pub seed: u64,
}

impl Default for DepthwiseParams {
    fn default() -> Self {
        Self {
            n_rounds: 300,
            learning_rate: 0.05,
            max_depth: 6,
            min_child_weight: 1.0,
            lambda: 1.0,
            gamma: 0.0,
            subsample: 0.8,
            max_bins: 256,
            early_stopping_rounds: 30,
            seed: 42,
        }
    }
}

pub struct DepthwiseBoostTrainer {
    params: DepthwiseParams,
    split: SplitConfig,
}

impl DepthwiseBoostTrainer {
    pub fn new(params: DepthwiseParams, split: SplitConfig) -> Self {
        Self { params, split }
    }
}

impl FamilyTrainer for DepthwiseBoostTrainer {
    fn family(&self) -> ModelFamily {
        ModelFamily::BoostedTreeB
    }

    #[instrument(skip_all, fields(family = "boosted_tree_b"))]
    fn train(&self, frame: &Frame, labels: &[u8], features: &FeatureSet) -> Result<(FittedModel, f64)> {
        let family = self.family();
        let p = &self.params;
        if p.max_depth == 0 || p.learning_rate <= 0.0 || p.lambda < 0.0 {
            return Err(EnsembleError::training(family, "max_depth must be > 0, learning_rate > 0, lambda >= 0"));
        }
        let prepared = Prepared::new(family, frame, labels, features, &self.split)?;

        let config = TreeConfig {
            max_depth: p.max_depth,
            min_child_weight: p.min_child_weight,
            lambda: p.lambda,
            gamma: p.gamma,
            categorical_split: CategoricalSplit::OneVsRest,
            leaf_scale: p.learning_rate,
            ..TreeConfig::default()
        };
        let schedule = BoostSchedule {
            n_rounds: p.n_rounds,
            subsample: p.subsample,
            early_stopping_rounds: p.early_stopping_rounds,
            seed: p.seed,
        };
        let (model, loss) = fit_cart_boosting(&prepared, config, p.max_bins, &schedule);
        let auc = prepared.holdout_auc(family, &model)?;
        info!(trees = model.trees.len(), holdout_log_loss = loss, auc, "trained boosted_tree_b");
        Ok((FittedModel::BoostedTreeB(model), auc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::tree::Node;

    #[test]
    fn test_initial_score_is_log_odds() {
        assert!(initial_score(&[0, 1]).abs() < 1e-12);
        let s = initial_score(&[1, 0, 0, 0]);
        assert!((s - (1.0f64 / 3.0).ln()).abs() < 1e-12);
        assert!(initial_score(&[1, 1]).is_finite());
    }

    #[test]
    fn test_boosted_trees_predict() {
        let model = BoostedTrees::new(
            vec!["x".to_string()],
            0.0,
            vec![Tree::new(vec![
                Node::internal(0, 0, 0.5, 1, 2),
                Node::leaf(1, -2.0),
                Node::leaf(2, 2.0),
            ])],
        );
        assert!(model.predict_row(&[0.0]) < 0.5);
        assert!(model.predict_row(&[1.0]) > 0.5);
        assert!(model.validate().is_ok());
    }

    #[test]
    fn test_run_boosting_reduces_loss() {
        let rows: Vec<Vec<f64>> = (0..200).map(|i| vec![(i % 20) as f64]).collect();
        let labels: Vec<u8> = rows.iter().map(|r| u8::from(r[0] >= 10.0)).collect();
        let data = BinnedData::from_rows(&rows, &[false], 32);
        let config = TreeConfig {
            max_depth: 2,
            leaf_scale: 0.3,
            ..TreeConfig::default()
        };
        let schedule = BoostSchedule {
            n_rounds: 20,
            subsample: 1.0,
            early_stopping_rounds: 5,
            seed: 3,
        };
        let boosted = run_boosting(&rows, &labels, &rows, &labels, &schedule, |r, g, h, rng| {
            CartBuilder::new(&config, &data, g, h).build(r, rng)
        });

        let baseline = log_loss(&labels, &vec![0.5; labels.len()]);
        assert!(boosted.best_loss < baseline);
        assert!(!boosted.trees.is_empty());
    }

    #[test]
    fn test_non_finite_model_is_rejected_for_json() {
        let model = BoostedTrees::new(vec!["x".to_string()], f64::NAN, vec![]);
        assert!(model.ensure_finite().is_err());
    }
}
