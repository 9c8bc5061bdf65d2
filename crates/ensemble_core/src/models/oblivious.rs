//! Oblivious-tree boosting with ordered target statistics (`boosted_tree_c`)
//!
//! Categorical columns are replaced by a smoothed positive rate per category.
//! During training each row only sees the statistics of rows that precede it
//! in a seeded permutation, so its own label never leaks into its encoding.
//! Inference uses the table accumulated over all training rows.
//!
//! Every level of an oblivious tree applies the same `(feature, threshold)`
//! test, so a tree of depth `d` is `d` splits plus `2^d` leaf values.

use super::boosting::{run_boosting, BoostSchedule, ScoreTree};
use super::cart::{BinnedColumn, BinnedData};
use super::{sigmoid, Classifier, FamilyTrainer, FittedModel, ModelFamily, Prepared};
use crate::config::SplitConfig;
use crate::deterministic::LcgRng;
use crate::errors::{EnsembleError, Result};
use crate::features::FeatureSet;
use crate::frame::{category_key, Frame};
use crate::serde_canon::{ensure_finite, CanonicalError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, instrument};

const MAX_DEPTH: usize = 10;

/// Accumulated label counts of one category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CategoryStat {
    pub key: i64,
    pub positives: f64,
    pub count: f64,
}

/// Target statistics for one categorical column
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetStatistics {
    pub column: usize,
    pub prior: f64,
    pub prior_weight: f64,
    /// Sorted by `key`
    pub table: Vec<CategoryStat>,
}

impl TargetStatistics {
    /// Smoothed positive rate; unseen categories get the prior
    pub fn encode(&self, value: f64) -> f64 {
        let key = category_key(value);
        match self.table.binary_search_by_key(&key, |s| s.key) {
            Ok(i) => {
                let s = &self.table[i];
                smoothed(s.positives, s.count, self.prior, self.prior_weight)
            }
            Err(_) => self.prior,
        }
    }
}

fn smoothed(positives: f64, count: f64, prior: f64, weight: f64) -> f64 {
    (positives + prior * weight) / (count + weight)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObliviousSplit {
    pub feature_idx: usize,
    pub threshold: f64,
}

/// Symmetric tree: level `i` sets bit `i` of the leaf index when the row goes right
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObliviousTree {
    pub splits: Vec<ObliviousSplit>,
    pub leaves: Vec<f64>,
}

impl ObliviousTree {
    pub fn leaf_index(&self, row: &[f64]) -> usize {
        self.splits.iter().enumerate().fold(0, |idx, (level, split)| {
            let value = row.get(split.feature_idx).copied().unwrap_or(f64::NAN);
            if value <= split.threshold {
                idx
            } else {
                idx | (1 << level)
            }
        })
    }

    pub fn evaluate(&self, row: &[f64]) -> f64 {
        self.leaves.get(self.leaf_index(row)).copied().unwrap_or(0.0)
    }
}

impl ScoreTree for ObliviousTree {
    fn score(&self, row: &[f64]) -> f64 {
        self.evaluate(row)
    }
}

/// Fitted `boosted_tree_c` model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObliviousBoost {
    pub columns: Vec<String>,
    pub base_score: f64,
    pub target_statistics: Vec<TargetStatistics>,
    pub trees: Vec<ObliviousTree>,
}

impl ObliviousBoost {
    /// Replace categorical values by their encoded rates
    pub fn encode_row(&self, row: &[f64]) -> Vec<f64> {
        let mut encoded = row.to_vec();
        for stats in &self.target_statistics {
            if let Some(v) = encoded.get_mut(stats.column) {
                *v = stats.encode(*v);
            }
        }
        encoded
    }

    pub(crate) fn ensure_finite(&self) -> std::result::Result<(), CanonicalError> {
        let stats = self.target_statistics.iter().flat_map(|s| {
            [s.prior, s.prior_weight]
                .into_iter()
                .chain(s.table.iter().flat_map(|c| [c.positives, c.count]))
        });
        let trees = self
            .trees
            .iter()
            .flat_map(|t| t.splits.iter().map(|s| s.threshold).chain(t.leaves.iter().copied()));
        ensure_finite("oblivious trees", std::iter::once(self.base_score).chain(stats).chain(trees))
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        let n = self.columns.len();
        for stats in &self.target_statistics {
            if stats.column >= n {
                return Err(format!("target statistics for column {} out of range", stats.column));
            }
            if stats.prior_weight <= 0.0 {
                return Err("target statistics prior weight must be positive".to_string());
            }
            if stats.table.windows(2).any(|w| w[0].key >= w[1].key) {
                return Err(format!("target statistics table for column {} is not sorted", stats.column));
            }
        }
        for (i, tree) in self.trees.iter().enumerate() {
            if tree.splits.len() > MAX_DEPTH || tree.leaves.len() != 1 << tree.splits.len() {
                return Err(format!("tree {i} has {} leaves for depth {}", tree.leaves.len(), tree.splits.len()));
            }
            if tree.splits.iter().any(|s| s.feature_idx >= n) {
                return Err(format!("tree {i} splits on an unknown column"));
            }
        }
        Ok(())
    }
}

impl Classifier for ObliviousBoost {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        let encoded = self.encode_row(row);
        let raw = self.base_score + self.trees.iter().map(|t| t.evaluate(&encoded)).sum::<f64>();
        sigmoid(raw)
    }
}

/// Parameters for oblivious-tree boosting (`boosted_tree_c`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ObliviousParams {
    pub n_rounds: usize,
    pub learning_rate: f64,
    pub depth: usize,
    pub l2_leaf_reg: f64,
    pub max_bins: usize,
    pub prior_weight: f64,
    pub early_stopping_rounds: usize,
    pub seed: u64,
}

impl Default for ObliviousParams {
    fn default() -> Self {
        Self {
            n_rounds: 300,
            learning_rate: 0.05,
            depth: 6,
            l2_leaf_reg: 3.0,
            max_bins: 128,
            prior_weight: 1.0,
            early_stopping_rounds: 30,
            seed: 42,
        }
    }
}

pub struct ObliviousBoostTrainer {
    params: ObliviousParams,
    split: SplitConfig,
}

impl ObliviousBoostTrainer {
    pub fn new(params: ObliviousParams, split: SplitConfig) -> Self {
        Self { params, split }
    }
}

impl FamilyTrainer for ObliviousBoostTrainer {
    fn family(&self) -> ModelFamily {
        ModelFamily::BoostedTreeC
    }

    #[instrument(skip_all, fields(family = "boosted_tree_c"))]
    fn train(&self, frame: &Frame, labels: &[u8], features: &FeatureSet) -> Result<(FittedModel, f64)> {
        let family = self.family();
        let p = &self.params;
        if p.depth == 0 || p.depth > MAX_DEPTH || p.learning_rate <= 0.0 || p.prior_weight <= 0.0 {
            return Err(EnsembleError::training(
                family,
                format!("depth must be in 1..={MAX_DEPTH}, learning_rate and prior_weight > 0"),
            ));
        }
        let prepared = Prepared::new(family, frame, labels, features, &self.split)?;
        let mut rng = LcgRng::new(p.seed);

        let (target_statistics, train_encoded) = fit_target_statistics(&prepared, p.prior_weight, &mut rng);
        let partial = ObliviousBoost {
            columns: prepared.columns.clone(),
            base_score: 0.0,
            target_statistics,
            trees: Vec::new(),
        };
        let valid_encoded: Vec<Vec<f64>> = prepared.valid_rows.iter().map(|r| partial.encode_row(r)).collect();

        // encoded columns are plain numbers from here on
        let numeric = vec![false; prepared.columns.len()];
        let data = BinnedData::from_rows(&train_encoded, &numeric, p.max_bins);
        let schedule = BoostSchedule {
            n_rounds: p.n_rounds,
            subsample: 1.0,
            early_stopping_rounds: p.early_stopping_rounds,
            seed: rng.next_u64(),
        };
        let boosted = run_boosting(
            &train_encoded,
            &prepared.train_labels,
            &valid_encoded,
            &prepared.valid_labels,
            &schedule,
            |rows, g, h, _| grow_oblivious(&data, &rows, g, h, p),
        );

        let model = ObliviousBoost {
            base_score: boosted.base_score,
            trees: boosted.trees,
            ..partial
        };
        let auc = prepared.holdout_auc(family, &model)?;
        info!(
            trees = model.trees.len(),
            holdout_log_loss = boosted.best_loss,
            auc,
            "trained boosted_tree_c"
        );
        Ok((FittedModel::BoostedTreeC(model), auc))
    }
}

/// Ordered encodings for the training rows plus the full inference tables
fn fit_target_statistics(
    prepared: &Prepared,
    prior_weight: f64,
    rng: &mut LcgRng,
) -> (Vec<TargetStatistics>, Vec<Vec<f64>>) {
    let n = prepared.train_rows.len();
    let positives = prepared.train_labels.iter().filter(|&&y| y == 1).count() as f64;
    let prior = positives / n.max(1) as f64;

    let mut order: Vec<usize> = (0..n).collect();
    rng.shuffle(&mut order);

    let mut encoded = prepared.train_rows.clone();
    let mut tables = Vec::new();

    for (column, _) in prepared.categorical.iter().enumerate().filter(|&(_, &c)| c) {
        let mut running: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
        for &row in &order {
            let key = category_key(prepared.train_rows[row][column]);
            let entry = running.entry(key).or_insert((0.0, 0.0));
            encoded[row][column] = smoothed(entry.0, entry.1, prior, prior_weight);
            entry.0 += f64::from(prepared.train_labels[row]);
            entry.1 += 1.0;
        }
        tables.push(TargetStatistics {
            column,
            prior,
            prior_weight,
            table: running
                .into_iter()
                .map(|(key, (positives, count))| CategoryStat { key, positives, count })
                .collect(),
        });
    }

    (tables, encoded)
}

/// Grow one oblivious tree level by level on histogram bins
fn grow_oblivious(data: &BinnedData, rows: &[usize], g: &[f64], h: &[f64], p: &ObliviousParams) -> ObliviousTree {
    let lambda = p.l2_leaf_reg;
    let score = |gs: f64, hs: f64| gs * gs / (hs + lambda);
    let mut leaf_of = vec![0usize; data.n_rows];
    let mut splits: Vec<ObliviousSplit> = Vec::new();

    for level in 0..p.depth {
        let n_leaves = 1usize << level;
        let mut best: Option<(f64, usize, u32, f64)> = None;

        for (feature_idx, column) in data.columns.iter().enumerate() {
            let BinnedColumn::Numeric { edges, bins } = column else {
                continue;
            };
            if edges.len() < 2 {
                continue;
            }
            let width = edges.len() + 1;
            let mut hist = vec![(0.0f64, 0.0f64); n_leaves * width];
            for &r in rows {
                let cell = &mut hist[leaf_of[r] * width + bins[r] as usize];
                cell.0 += g[r];
                cell.1 += h[r];
            }
            let totals: Vec<(f64, f64)> = (0..n_leaves)
                .map(|leaf| {
                    hist[leaf * width..(leaf + 1) * width]
                        .iter()
                        .fold((0.0, 0.0), |acc, c| (acc.0 + c.0, acc.1 + c.1))
                })
                .collect();
            let parent: f64 = totals.iter().map(|&(gs, hs)| score(gs, hs)).sum();

            let mut left = vec![(0.0f64, 0.0f64); n_leaves];
            for bin in 0..edges.len() - 1 {
                let mut children = 0.0;
                for leaf in 0..n_leaves {
                    let cell = hist[leaf * width + bin];
                    left[leaf].0 += cell.0;
                    left[leaf].1 += cell.1;
                    let (tg, th) = totals[leaf];
                    children += score(left[leaf].0, left[leaf].1) + score(tg - left[leaf].0, th - left[leaf].1);
                }
                let gain = children - parent;
                if gain > 1e-12 && best.map_or(true, |b| gain > b.0) {
                    best = Some((gain, feature_idx, bin as u32, edges[bin]));
                }
            }
        }

        let Some((_, feature_idx, bin, threshold)) = best else {
            break;
        };
        if let BinnedColumn::Numeric { bins, .. } = &data.columns[feature_idx] {
            for &r in rows {
                if bins[r] > bin {
                    leaf_of[r] |= 1 << level;
                }
            }
        }
        splits.push(ObliviousSplit {
            feature_idx,
            threshold,
        });
    }

    let n_leaves = 1usize << splits.len();
    let mut sums = vec![(0.0f64, 0.0f64); n_leaves];
    for &r in rows {
        sums[leaf_of[r]].0 += g[r];
        sums[leaf_of[r]].1 += h[r];
    }
    let leaves = sums
        .iter()
        .map(|&(gs, hs)| -gs / (hs + lambda) * p.learning_rate)
        .collect();

    ObliviousTree { splits, leaves }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_index_uses_level_bits() {
        let tree = ObliviousTree {
            splits: vec![
                ObliviousSplit { feature_idx: 0, threshold: 0.5 },
                ObliviousSplit { feature_idx: 1, threshold: 0.5 },
            ],
            leaves: vec![0.0, 1.0, 2.0, 3.0],
        };
        assert_eq!(tree.evaluate(&[0.0, 0.0]), 0.0);
        assert_eq!(tree.evaluate(&[1.0, 0.0]), 1.0);
        assert_eq!(tree.evaluate(&[0.0, 1.0]), 2.0);
        assert_eq!(tree.evaluate(&[1.0, 1.0]), 3.0);
        assert_eq!(tree.evaluate(&[f64::NAN, 0.0]), 1.0);
    }

    #[test]
    fn test_target_statistics_smoothing() {
        let stats = TargetStatistics {
            column: 0,
            prior: 0.25,
            prior_weight: 1.0,
            table: vec![CategoryStat { key: 3, positives: 3.0, count: 3.0 }],
        };
        assert!((stats.encode(3.0) - (3.25 / 4.0)).abs() < 1e-12);
        assert_eq!(stats.encode(9.0), 0.25);
    }

    #[test]
    fn test_grow_oblivious_separates_signal() {
        let rows: Vec<Vec<f64>> = (0..40).map(|i| vec![(i % 10) as f64]).collect();
        let labels: Vec<f64> = rows.iter().map(|r| if r[0] >= 5.0 { 1.0 } else { 0.0 }).collect();
        let data = BinnedData::from_rows(&rows, &[false], 16);
        let g: Vec<f64> = labels.iter().map(|y| 0.5 - y).collect();
        let h = vec![0.25; rows.len()];
        let params = ObliviousParams {
            depth: 1,
            learning_rate: 1.0,
            ..ObliviousParams::default()
        };
        let tree = grow_oblivious(&data, &(0..rows.len()).collect::<Vec<_>>(), &g, &h, &params);

        assert_eq!(tree.splits.len(), 1);
        assert_eq!(tree.splits[0].threshold, 4.0);
        assert!(tree.evaluate(&[2.0]) < 0.0);
        assert!(tree.evaluate(&[7.0]) > 0.0);
    }

    #[test]
    fn test_validate_rejects_bad_leaf_count() {
        let model = ObliviousBoost {
            columns: vec!["x".to_string()],
            base_score: 0.0,
            target_statistics: vec![],
            trees: vec![ObliviousTree {
                splits: vec![ObliviousSplit { feature_idx: 0, threshold: 1.0 }],
                leaves: vec![0.0],
            }],
        };
        assert!(model.validate().is_err());
    }
}
