//! CART builder on gradient/hessian statistics
//!
//! Shared by the boosted families and the random forest. Numeric columns are
//! bucketed once into histogram bins, categorical columns are grouped by
//! category key. Trees grow depth-wise, or leaf-wise when `max_leaves` is set.

use super::tree::{Node, Tree};
use crate::deterministic::LcgRng;
use crate::frame::category_key;
use std::collections::BTreeMap;

/// Smoothing added to hessians when ordering categories by gradient ratio
const CATEGORY_SMOOTHING: f64 = 10.0;

const MIN_GAIN: f64 = 1e-12;

/// How categorical columns are split
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CategoricalSplit {
    /// Categories sorted by `G/(H+s)`, best prefix goes left
    GradientSorted,
    /// A single category goes left
    OneVsRest,
}

/// Training parameters for a single tree
#[derive(Clone, Debug)]
pub(crate) struct TreeConfig {
    pub max_depth: usize,
    pub max_leaves: Option<usize>,
    pub min_samples_leaf: usize,
    pub min_child_weight: f64,
    pub lambda: f64,
    pub gamma: f64,
    pub categorical_split: CategoricalSplit,
    /// Columns considered per split; all when `None`
    pub features_per_split: Option<usize>,
    /// Multiplier folded into every leaf value (learning rate)
    pub leaf_scale: f64,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_depth: 6,
            max_leaves: None,
            min_samples_leaf: 1,
            min_child_weight: 0.0,
            lambda: 0.0,
            gamma: 0.0,
            categorical_split: CategoricalSplit::OneVsRest,
            features_per_split: None,
            leaf_scale: 1.0,
        }
    }
}

/// One column of the training rows, pre-bucketed
#[derive(Clone, Debug)]
pub(crate) enum BinnedColumn {
    /// `bins[i]` is the first edge `>= x`; missing values use bin `edges.len()`
    Numeric { edges: Vec<f64>, bins: Vec<u32> },
    Categorical { keys: Vec<i64> },
}

/// Column-major bucketed view of the training rows
#[derive(Clone, Debug)]
pub(crate) struct BinnedData {
    pub columns: Vec<BinnedColumn>,
    pub n_rows: usize,
}

impl BinnedData {
    pub fn from_rows(rows: &[Vec<f64>], categorical: &[bool], max_bins: usize) -> Self {
        let n_cols = rows.first().map_or(categorical.len(), Vec::len);
        let columns = (0..n_cols)
            .map(|c| {
                let values: Vec<f64> = rows.iter().map(|r| r[c]).collect();
                if categorical.get(c).copied().unwrap_or(false) {
                    BinnedColumn::Categorical {
                        keys: values.iter().map(|&v| category_key(v)).collect(),
                    }
                } else {
                    bin_numeric(&values, max_bins)
                }
            })
            .collect();
        Self {
            columns,
            n_rows: rows.len(),
        }
    }
}

fn bin_numeric(values: &[f64], max_bins: usize) -> BinnedColumn {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(f64::total_cmp);
    sorted.dedup();

    let max_bins = max_bins.max(2);
    let edges = if sorted.len() <= max_bins {
        sorted
    } else {
        let mut edges: Vec<f64> = (1..=max_bins)
            .map(|k| sorted[k * sorted.len() / max_bins - 1])
            .collect();
        edges.dedup();
        edges
    };

    let missing = edges.len() as u32;
    let last = edges.len().saturating_sub(1);
    let bins = values
        .iter()
        .map(|&v| {
            if v.is_finite() {
                edges.partition_point(|e| *e < v).min(last) as u32
            } else {
                missing
            }
        })
        .collect();
    BinnedColumn::Numeric { edges, bins }
}

#[derive(Clone, Copy, Debug, Default)]
struct GradStats {
    g: f64,
    h: f64,
    n: usize,
}

impl GradStats {
    fn add(&mut self, g: f64, h: f64) {
        self.g += g;
        self.h += h;
        self.n += 1;
    }

    fn minus(&self, other: &GradStats) -> GradStats {
        GradStats {
            g: self.g - other.g,
            h: self.h - other.h,
            n: self.n - other.n,
        }
    }
}

#[derive(Clone, Debug)]
enum SplitRule {
    /// Bins `0..=bin` go left
    Bin { bin: u32, threshold: f64 },
    Categories(Vec<i64>),
}

#[derive(Clone, Debug)]
struct SplitCandidate {
    feature_idx: usize,
    gain: f64,
    rule: SplitRule,
}

struct OpenLeaf {
    node: usize,
    rows: Vec<usize>,
    depth: usize,
    split: Option<SplitCandidate>,
}

/// Builds one tree over positions into the binned training rows
pub(crate) struct CartBuilder<'a> {
    config: &'a TreeConfig,
    data: &'a BinnedData,
    gradients: &'a [f64],
    hessians: &'a [f64],
}

impl<'a> CartBuilder<'a> {
    pub fn new(config: &'a TreeConfig, data: &'a BinnedData, gradients: &'a [f64], hessians: &'a [f64]) -> Self {
        debug_assert_eq!(gradients.len(), data.n_rows);
        debug_assert_eq!(hessians.len(), data.n_rows);
        Self {
            config,
            data,
            gradients,
            hessians,
        }
    }

    /// Grow a tree on `rows` (positions may repeat for bootstrap samples)
    pub fn build(&self, rows: Vec<usize>, rng: &mut LcgRng) -> Tree {
        let mut nodes = vec![Node::leaf(0, self.leaf_value(&rows))];
        let split = self.candidate(&rows, 0, rng);
        let mut open = vec![OpenLeaf {
            node: 0,
            rows,
            depth: 0,
            split,
        }];
        let mut leaves = 1usize;

        loop {
            if self.config.max_leaves.is_some_and(|max| leaves >= max) {
                break;
            }

            // best pending split; ties go to the older node
            let pick = open
                .iter()
                .enumerate()
                .filter_map(|(i, leaf)| leaf.split.as_ref().map(|s| (i, s.gain, leaf.node)))
                .max_by(|a, b| a.1.total_cmp(&b.1).then(b.2.cmp(&a.2)));
            let Some((pos, _, _)) = pick else {
                break;
            };

            let leaf = open.remove(pos);
            let Some(split) = leaf.split else {
                break;
            };
            let (left_rows, right_rows) = self.partition(&leaf.rows, &split);

            let left_id = nodes.len();
            let right_id = left_id + 1;
            nodes.push(Node::leaf(left_id as i32, self.leaf_value(&left_rows)));
            nodes.push(Node::leaf(right_id as i32, self.leaf_value(&right_rows)));
            nodes[leaf.node] = match &split.rule {
                SplitRule::Bin { threshold, .. } => Node::internal(
                    leaf.node as i32,
                    split.feature_idx as i32,
                    *threshold,
                    left_id as i32,
                    right_id as i32,
                ),
                SplitRule::Categories(keys) => Node::categorical(
                    leaf.node as i32,
                    split.feature_idx as i32,
                    keys.clone(),
                    left_id as i32,
                    right_id as i32,
                ),
            };
            leaves += 1;

            let depth = leaf.depth + 1;
            for (node, rows) in [(left_id, left_rows), (right_id, right_rows)] {
                let split = self.candidate(&rows, depth, rng);
                open.push(OpenLeaf {
                    node,
                    rows,
                    depth,
                    split,
                });
            }
        }

        Tree::new(nodes)
    }

    fn candidate(&self, rows: &[usize], depth: usize, rng: &mut LcgRng) -> Option<SplitCandidate> {
        if depth >= self.config.max_depth || rows.len() < 2 * self.config.min_samples_leaf.max(1) {
            return None;
        }
        self.find_best_split(rows, rng)
    }

    fn find_best_split(&self, rows: &[usize], rng: &mut LcgRng) -> Option<SplitCandidate> {
        let n_features = self.data.columns.len();
        let features: Vec<usize> = match self.config.features_per_split {
            Some(k) if k < n_features => rng.sample_indices(n_features, k.max(1)),
            _ => (0..n_features).collect(),
        };

        let mut total = GradStats::default();
        for &r in rows {
            total.add(self.gradients[r], self.hessians[r]);
        }

        let mut best: Option<SplitCandidate> = None;
        for feature_idx in features {
            let candidate = match &self.data.columns[feature_idx] {
                BinnedColumn::Numeric { edges, bins } => self.best_numeric(rows, edges, bins, &total),
                BinnedColumn::Categorical { keys } => self.best_categorical(rows, keys, &total),
            };
            if let Some((gain, rule)) = candidate {
                // strictly better wins, so lower feature indices win ties
                if best.as_ref().map_or(true, |b| gain > b.gain) {
                    best = Some(SplitCandidate {
                        feature_idx,
                        gain,
                        rule,
                    });
                }
            }
        }
        best
    }

    fn best_numeric(&self, rows: &[usize], edges: &[f64], bins: &[u32], total: &GradStats) -> Option<(f64, SplitRule)> {
        if edges.len() < 2 && !rows.iter().any(|&r| bins[r] as usize == edges.len()) {
            return None;
        }
        let mut hist = vec![GradStats::default(); edges.len() + 1];
        for &r in rows {
            hist[bins[r] as usize].add(self.gradients[r], self.hessians[r]);
        }

        let mut best: Option<(f64, SplitRule)> = None;
        let mut left = GradStats::default();
        for (bin, edge) in edges.iter().enumerate() {
            let h = hist[bin];
            left.g += h.g;
            left.h += h.h;
            left.n += h.n;
            let right = total.minus(&left);
            if let Some(gain) = self.split_gain(&left, &right, total) {
                if best.as_ref().map_or(true, |(g, _)| gain > *g) {
                    best = Some((
                        gain,
                        SplitRule::Bin {
                            bin: bin as u32,
                            threshold: *edge,
                        },
                    ));
                }
            }
        }
        best
    }

    fn best_categorical(&self, rows: &[usize], keys: &[i64], total: &GradStats) -> Option<(f64, SplitRule)> {
        let mut groups: BTreeMap<i64, GradStats> = BTreeMap::new();
        for &r in rows {
            groups.entry(keys[r]).or_default().add(self.gradients[r], self.hessians[r]);
        }
        if groups.len() < 2 {
            return None;
        }

        let mut best: Option<(f64, SplitRule)> = None;
        let mut consider = |left_keys: &[i64], left: &GradStats| {
            let right = total.minus(left);
            if let Some(gain) = self.split_gain(left, &right, total) {
                if best.as_ref().map_or(true, |(g, _)| gain > *g) {
                    best = Some((gain, SplitRule::Categories(left_keys.to_vec())));
                }
            }
        };

        match self.config.categorical_split {
            CategoricalSplit::OneVsRest => {
                for (key, stats) in &groups {
                    consider(&[*key], stats);
                }
            }
            CategoricalSplit::GradientSorted => {
                let mut ordered: Vec<(i64, GradStats)> = groups.into_iter().collect();
                ordered.sort_by(|a, b| {
                    let ra = a.1.g / (a.1.h + CATEGORY_SMOOTHING);
                    let rb = b.1.g / (b.1.h + CATEGORY_SMOOTHING);
                    ra.total_cmp(&rb).then(a.0.cmp(&b.0))
                });
                let mut left = GradStats::default();
                let mut left_keys = Vec::with_capacity(ordered.len());
                for (key, stats) in &ordered[..ordered.len() - 1] {
                    left.g += stats.g;
                    left.h += stats.h;
                    left.n += stats.n;
                    left_keys.push(*key);
                    consider(&left_keys, &left);
                }
            }
        }
        best
    }

    /// Regularised gain, or `None` when the split violates a constraint
    fn split_gain(&self, left: &GradStats, right: &GradStats, parent: &GradStats) -> Option<f64> {
        let cfg = self.config;
        if left.n < cfg.min_samples_leaf.max(1) || right.n < cfg.min_samples_leaf.max(1) {
            return None;
        }
        if left.h < cfg.min_child_weight || right.h < cfg.min_child_weight {
            return None;
        }
        let gain = 0.5 * (self.score(left) + self.score(right) - self.score(parent)) - cfg.gamma;
        (gain.is_finite() && gain > MIN_GAIN).then_some(gain)
    }

    fn score(&self, stats: &GradStats) -> f64 {
        let denom = stats.h + self.config.lambda;
        if denom <= 0.0 {
            0.0
        } else {
            stats.g * stats.g / denom
        }
    }

    fn leaf_value(&self, rows: &[usize]) -> f64 {
        let mut stats = GradStats::default();
        for &r in rows {
            stats.add(self.gradients[r], self.hessians[r]);
        }
        let denom = stats.h + self.config.lambda;
        if denom <= 0.0 {
            0.0
        } else {
            -stats.g / denom * self.config.leaf_scale
        }
    }

    fn partition(&self, rows: &[usize], split: &SplitCandidate) -> (Vec<usize>, Vec<usize>) {
        let column = &self.data.columns[split.feature_idx];
        rows.iter().partition(|&&r| match (&split.rule, column) {
            (SplitRule::Bin { bin, .. }, BinnedColumn::Numeric { bins, .. }) => bins[r] <= *bin,
            (SplitRule::Categories(set), BinnedColumn::Categorical { keys }) => set.binary_search(&keys[r]).is_ok(),
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(rows: &[Vec<f64>], categorical: &[bool], y: &[f64], config: &TreeConfig) -> Tree {
        let data = BinnedData::from_rows(rows, categorical, 32);
        // squared loss around 0: g = -y, h = 1
        let g: Vec<f64> = y.iter().map(|v| -v).collect();
        let h = vec![1.0; y.len()];
        let builder = CartBuilder::new(config, &data, &g, &h);
        builder.build((0..rows.len()).collect(), &mut LcgRng::new(1))
    }

    #[test]
    fn test_simple_numeric_split() {
        let rows: Vec<Vec<f64>> = (0..8).map(|i| vec![i as f64]).collect();
        let y = [0.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0];
        let tree = build(&rows, &[false], &y, &TreeConfig::default());

        assert_eq!(tree.nodes[0].threshold, 3.0);
        assert_eq!(tree.evaluate(&[2.0]), 0.0);
        assert_eq!(tree.evaluate(&[6.0]), 1.0);
        assert!(tree.validate(1).is_ok());
    }

    #[test]
    fn test_leaf_only_tree() {
        let rows = vec![vec![1.0]];
        let tree = build(&rows, &[false], &[0.5], &TreeConfig::default());
        assert_eq!(tree.nodes.len(), 1);
        assert_eq!(tree.evaluate(&[1.0]), 0.5);
    }

    #[test]
    fn test_missing_values_go_right() {
        let rows = vec![vec![1.0], vec![1.0], vec![f64::NAN], vec![f64::NAN]];
        let y = [0.0, 0.0, 1.0, 1.0];
        let tree = build(&rows, &[false], &y, &TreeConfig::default());
        assert_eq!(tree.evaluate(&[1.0]), 0.0);
        assert_eq!(tree.evaluate(&[f64::NAN]), 1.0);
    }

    #[test]
    fn test_gradient_sorted_categories_group_together() {
        // categories 1 and 3 share a target, 2 and 4 share the other
        let keys = [1.0, 2.0, 3.0, 4.0];
        let rows: Vec<Vec<f64>> = (0..16).map(|i| vec![keys[i % 4]]).collect();
        let y: Vec<f64> = rows.iter().map(|r| if r[0] as i64 % 2 == 1 { 1.0 } else { 0.0 }).collect();
        let config = TreeConfig {
            max_depth: 1,
            categorical_split: CategoricalSplit::GradientSorted,
            ..TreeConfig::default()
        };
        let tree = build(&rows, &[true], &y, &config);

        assert!(tree.nodes[0].is_categorical());
        assert_eq!(tree.evaluate(&[1.0]), tree.evaluate(&[3.0]));
        assert_eq!(tree.evaluate(&[2.0]), tree.evaluate(&[4.0]));
        assert_ne!(tree.evaluate(&[1.0]), tree.evaluate(&[2.0]));
    }

    #[test]
    fn test_leafwise_respects_leaf_budget() {
        let rows: Vec<Vec<f64>> = (0..64).map(|i| vec![i as f64, (i % 7) as f64]).collect();
        let y: Vec<f64> = (0..64).map(|i| ((i * 37) % 11) as f64).collect();
        let config = TreeConfig {
            max_depth: 10,
            max_leaves: Some(5),
            ..TreeConfig::default()
        };
        let tree = build(&rows, &[false, false], &y, &config);
        assert_eq!(tree.leaf_count(), 5);
    }

    #[test]
    fn test_regularisation_shrinks_leaves() {
        let rows: Vec<Vec<f64>> = (0..4).map(|i| vec![i as f64]).collect();
        let y = [1.0; 4];
        let plain = build(&rows, &[false], &y, &TreeConfig::default());
        let shrunk = build(
            &rows,
            &[false],
            &y,
            &TreeConfig {
                lambda: 4.0,
                ..TreeConfig::default()
            },
        );
        assert_eq!(plain.evaluate(&[0.0]), 1.0);
        assert_eq!(shrunk.evaluate(&[0.0]), 0.5);
    }
}
