//! Feed-forward network (`neural_net`)
//!
//! Numeric columns are standardised with statistics of the training rows
//! only; missing values become the column mean. Each categorical column is
//! looked up in its own embedding table, where row 0 is reserved for
//! categories never seen in training. Hidden layers use ReLU and the single
//! output unit a sigmoid. Optimisation is mini-batch Adam with global-norm
//! gradient clipping, early-stopped on holdout AUC with the best parameters
//! restored.

use super::{sigmoid, Classifier, FamilyTrainer, FittedModel, ModelFamily, Prepared};
use crate::config::SplitConfig;
use crate::deterministic::LcgRng;
use crate::errors::{EnsembleError, Result};
use crate::features::FeatureSet;
use crate::frame::{category_key, Frame};
use crate::metrics::roc_auc;
use ndarray::{s, Array, Array1, Array2, Axis, Dimension, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, instrument};

const BETA1: f64 = 0.9;
const BETA2: f64 = 0.999;
const EPSILON: f64 = 1e-8;

/// Per-column standardisation fitted on training rows
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl StandardScaler {
    /// Fit on `columns` of `rows`, ignoring non-finite values
    pub fn fit(rows: &[Vec<f64>], columns: &[usize]) -> Self {
        let mut mean = Vec::with_capacity(columns.len());
        let mut std = Vec::with_capacity(columns.len());
        for &c in columns {
            let values: Vec<f64> = rows.iter().map(|r| r[c]).filter(|v| v.is_finite()).collect();
            let n = values.len().max(1) as f64;
            let m = values.iter().sum::<f64>() / n;
            let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
            mean.push(m);
            std.push(if var.sqrt() > 1e-12 { var.sqrt() } else { 1.0 });
        }
        Self { mean, std }
    }

    pub fn transform(&self, i: usize, value: f64) -> f64 {
        if value.is_finite() {
            (value - self.mean[i]) / self.std[i]
        } else {
            0.0
        }
    }
}

/// Learned vectors for one categorical column
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Embedding {
    pub column: usize,
    /// Sorted category keys; key `keys[i]` uses table row `i + 1`
    pub keys: Vec<i64>,
    pub table: Array2<f64>,
}

impl Embedding {
    pub fn index(&self, value: f64) -> usize {
        self.keys
            .binary_search(&category_key(value))
            .map_or(0, |i| i + 1)
    }

    pub fn dim(&self) -> usize {
        self.table.ncols()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DenseLayer {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
}

/// Fitted network
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NeuralNet {
    pub columns: Vec<String>,
    pub numeric: Vec<usize>,
    pub scaler: StandardScaler,
    pub embeddings: Vec<Embedding>,
    pub layers: Vec<DenseLayer>,
}

impl NeuralNet {
    pub fn input_width(&self) -> usize {
        self.numeric.len() + self.embeddings.iter().map(Embedding::dim).sum::<usize>()
    }

    /// Network input for a batch, plus the embedding row used per example
    fn input_matrix(&self, rows: &[&[f64]]) -> (Array2<f64>, Vec<Vec<usize>>) {
        let mut x = Array2::zeros((rows.len(), self.input_width()));
        let mut lookups = vec![Vec::with_capacity(rows.len()); self.embeddings.len()];
        for (b, row) in rows.iter().enumerate() {
            for (i, &c) in self.numeric.iter().enumerate() {
                x[[b, i]] = self.scaler.transform(i, row[c]);
            }
            let mut offset = self.numeric.len();
            for (e, emb) in self.embeddings.iter().enumerate() {
                let idx = emb.index(row[emb.column]);
                x.slice_mut(s![b, offset..offset + emb.dim()])
                    .assign(&emb.table.row(idx));
                lookups[e].push(idx);
                offset += emb.dim();
            }
        }
        (x, lookups)
    }

    /// Layer activations; the last entry holds the output logits
    fn forward(&self, input: Array2<f64>) -> Vec<Array2<f64>> {
        let mut acts = Vec::with_capacity(self.layers.len() + 1);
        acts.push(input);
        for (i, layer) in self.layers.iter().enumerate() {
            let mut z = acts[i].dot(&layer.weights) + &layer.bias;
            if i + 1 < self.layers.len() {
                z.mapv_inplace(|v| v.max(0.0));
            }
            acts.push(z);
        }
        acts
    }

    fn predict_batch(&self, rows: &[&[f64]]) -> Vec<f64> {
        let (x, _) = self.input_matrix(rows);
        let acts = self.forward(x);
        acts.last()
            .map(|logits| logits.column(0).iter().map(|&z| sigmoid(z)).collect())
            .unwrap_or_default()
    }

    fn backward(&self, acts: &[Array2<f64>], lookups: &[Vec<usize>], labels: &[f64]) -> Gradients {
        let n = labels.len() as f64;
        let mut delta = match acts.last() {
            Some(logits) => {
                let mut d = logits.mapv(sigmoid);
                for (v, &y) in d.column_mut(0).iter_mut().zip(labels) {
                    *v = (*v - y) / n;
                }
                d
            }
            None => Array2::zeros((labels.len(), 1)),
        };

        let mut layers = Vec::with_capacity(self.layers.len());
        for l in (0..self.layers.len()).rev() {
            let prev = &acts[l];
            layers.push((prev.t().dot(&delta), delta.sum_axis(Axis(0))));
            let mut d_prev = delta.dot(&self.layers[l].weights.t());
            if l > 0 {
                Zip::from(&mut d_prev).and(prev).for_each(|d, &a| {
                    if a <= 0.0 {
                        *d = 0.0;
                    }
                });
            }
            delta = d_prev;
        }
        layers.reverse();

        let mut embeddings = Vec::with_capacity(self.embeddings.len());
        let mut offset = self.numeric.len();
        for (emb, rows) in self.embeddings.iter().zip(lookups) {
            let mut grad = Array2::<f64>::zeros(emb.table.raw_dim());
            for (b, &idx) in rows.iter().enumerate() {
                let upstream = delta.slice(s![b, offset..offset + emb.dim()]);
                let mut target = grad.row_mut(idx);
                target += &upstream;
            }
            embeddings.push(grad);
            offset += emb.dim();
        }

        Gradients { layers, embeddings }
    }

    fn parameters(&self) -> impl Iterator<Item = f64> + '_ {
        let layers = self
            .layers
            .iter()
            .flat_map(|l| l.weights.iter().chain(l.bias.iter()).copied());
        let embeddings = self.embeddings.iter().flat_map(|e| e.table.iter().copied());
        layers.chain(embeddings)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.layers.is_empty() {
            return Err("network has no layers".to_string());
        }
        if self.scaler.mean.len() != self.numeric.len() || self.scaler.std.len() != self.numeric.len() {
            return Err("scaler does not match numeric columns".to_string());
        }
        let n = self.columns.len();
        if self.numeric.iter().chain(self.embeddings.iter().map(|e| &e.column)).any(|&c| c >= n) {
            return Err("input refers to an unknown column".to_string());
        }
        for emb in &self.embeddings {
            if emb.table.nrows() != emb.keys.len() + 1 {
                return Err(format!("embedding for column {} has wrong row count", emb.column));
            }
        }
        let mut width = self.input_width();
        for (i, layer) in self.layers.iter().enumerate() {
            if layer.weights.nrows() != width || layer.bias.len() != layer.weights.ncols() {
                return Err(format!("layer {i} shape mismatch"));
            }
            width = layer.weights.ncols();
        }
        if width != 1 {
            return Err("output layer must have one unit".to_string());
        }
        if !self.parameters().all(f64::is_finite) {
            return Err("non-finite parameter".to_string());
        }
        Ok(())
    }
}

impl Classifier for NeuralNet {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn predict_row(&self, row: &[f64]) -> f64 {
        self.predict_batch(&[row]).first().copied().unwrap_or(f64::NAN)
    }
}

/// Gradients shaped like the network parameters
#[derive(Debug, Clone)]
struct Gradients {
    layers: Vec<(Array2<f64>, Array1<f64>)>,
    embeddings: Vec<Array2<f64>>,
}

impl Gradients {
    fn zeros_like(net: &NeuralNet) -> Self {
        Self {
            layers: net
                .layers
                .iter()
                .map(|l| (Array2::zeros(l.weights.raw_dim()), Array1::zeros(l.bias.len())))
                .collect(),
            embeddings: net.embeddings.iter().map(|e| Array2::zeros(e.table.raw_dim())).collect(),
        }
    }

    fn norm(&self) -> f64 {
        let layers: f64 = self
            .layers
            .iter()
            .map(|(w, b)| w.iter().chain(b.iter()).map(|g| g * g).sum::<f64>())
            .sum();
        let embeddings: f64 = self.embeddings.iter().map(|e| e.iter().map(|g| g * g).sum::<f64>()).sum();
        (layers + embeddings).sqrt()
    }

    fn clip(&mut self, max_norm: f64) {
        let norm = self.norm();
        if norm > max_norm && norm.is_finite() {
            let k = max_norm / norm;
            for (w, b) in &mut self.layers {
                *w *= k;
                *b *= k;
            }
            for e in &mut self.embeddings {
                *e *= k;
            }
        }
    }
}

struct Adam {
    step: i32,
    learning_rate: f64,
    m: Gradients,
    v: Gradients,
}

impl Adam {
    fn new(net: &NeuralNet, learning_rate: f64) -> Self {
        Self {
            step: 0,
            learning_rate,
            m: Gradients::zeros_like(net),
            v: Gradients::zeros_like(net),
        }
    }

    fn update(&mut self, net: &mut NeuralNet, grads: &Gradients) {
        self.step += 1;
        let lr = self.learning_rate * (1.0 - BETA2.powi(self.step)).sqrt() / (1.0 - BETA1.powi(self.step));

        for (i, layer) in net.layers.iter_mut().enumerate() {
            let (gw, gb) = &grads.layers[i];
            let (mw, mb) = &mut self.m.layers[i];
            let (vw, vb) = &mut self.v.layers[i];
            adam_step(&mut layer.weights, gw, mw, vw, lr);
            adam_step(&mut layer.bias, gb, mb, vb, lr);
        }
        for (i, emb) in net.embeddings.iter_mut().enumerate() {
            adam_step(&mut emb.table, &grads.embeddings[i], &mut self.m.embeddings[i], &mut self.v.embeddings[i], lr);
        }
    }
}

fn adam_step<D: Dimension>(
    param: &mut Array<f64, D>,
    grad: &Array<f64, D>,
    m: &mut Array<f64, D>,
    v: &mut Array<f64, D>,
    lr: f64,
) {
    Zip::from(param).and(grad).and(m).and(v).for_each(|p, &g, m, v| {
        *m = BETA1 * *m + (1.0 - BETA1) * g;
        *v = BETA2 * *v + (1.0 - BETA2) * g * g;
        *p -= lr * *m / (v.sqrt() + EPSILON);
    });
}

/// Parameters for `neural_net`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NeuralParams {
    pub hidden_layers: Vec<usize>,
    pub max_embedding_dim: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub grad_clip: f64,
    pub patience: usize,
    pub seed: u64,
}

impl Default for NeuralParams {
    fn default() -> Self {
        Self {
            hidden_layers: vec![128, 64, 32],
            max_embedding_dim: 8,
            epochs: 100,
            batch_size: 256,
            learning_rate: 1e-3,
            weight_decay: 1e-5,
            grad_clip: 1.0,
            patience: 10,
            seed: 42,
        }
    }
}

pub struct NeuralNetTrainer {
    params: NeuralParams,
    split: SplitConfig,
}

impl NeuralNetTrainer {
    pub fn new(params: NeuralParams, split: SplitConfig) -> Self {
        Self { params, split }
    }

    fn initialise(&self, prepared: &Prepared, rng: &mut LcgRng) -> NeuralNet {
        let p = &self.params;
        let numeric: Vec<usize> = (0..prepared.columns.len()).filter(|&c| !prepared.categorical[c]).collect();
        let scaler = StandardScaler::fit(&prepared.train_rows, &numeric);

        let embeddings = (0..prepared.columns.len())
            .filter(|&c| prepared.categorical[c])
            .map(|column| {
                let keys: Vec<i64> = prepared
                    .train_rows
                    .iter()
                    .map(|r| category_key(r[column]))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect();
                let dim = ((keys.len() + 2) / 2).clamp(1, p.max_embedding_dim.max(1));
                let table = Array2::from_shape_fn((keys.len() + 1, dim), |_| (rng.next_f64() - 0.5) * 0.1);
                Embedding { column, keys, table }
            })
            .collect();

        let mut net = NeuralNet {
            columns: prepared.columns.clone(),
            numeric,
            scaler,
            embeddings,
            layers: Vec::new(),
        };

        let mut fan_in = net.input_width();
        let widths: Vec<usize> = p.hidden_layers.iter().copied().chain(std::iter::once(1)).collect();
        for width in widths {
            let limit = (6.0 / fan_in.max(1) as f64).sqrt();
            let weights = Array2::from_shape_fn((fan_in, width), |_| (rng.next_f64() * 2.0 - 1.0) * limit);
            net.layers.push(DenseLayer {
                weights,
                bias: Array1::zeros(width),
            });
            fan_in = width;
        }
        net
    }
}

impl FamilyTrainer for NeuralNetTrainer {
    fn family(&self) -> ModelFamily {
        ModelFamily::NeuralNet
    }

    #[instrument(skip_all, fields(family = "neural_net"))]
    fn train(&self, frame: &Frame, labels: &[u8], features: &FeatureSet) -> Result<(FittedModel, f64)> {
        let family = self.family();
        let p = &self.params;
        if p.epochs == 0 || p.batch_size == 0 || p.learning_rate <= 0.0 || p.hidden_layers.contains(&0) {
            return Err(EnsembleError::training(
                family,
                "epochs, batch_size, learning_rate and every hidden width must be positive",
            ));
        }
        let prepared = Prepared::new(family, frame, labels, features, &self.split)?;
        let mut rng = LcgRng::new(p.seed);
        let mut net = self.initialise(&prepared, &mut rng);
        let mut adam = Adam::new(&net, p.learning_rate);

        let targets: Vec<f64> = prepared.train_labels.iter().map(|&y| f64::from(y)).collect();
        let valid: Vec<&[f64]> = prepared.valid_rows.iter().map(Vec::as_slice).collect();
        let mut order: Vec<usize> = (0..prepared.train_rows.len()).collect();

        let mut best: Option<(f64, NeuralNet)> = None;
        let mut stale = 0usize;

        for epoch in 0..p.epochs {
            rng.shuffle(&mut order);
            for batch in order.chunks(p.batch_size) {
                let rows: Vec<&[f64]> = batch.iter().map(|&i| prepared.train_rows[i].as_slice()).collect();
                let y: Vec<f64> = batch.iter().map(|&i| targets[i]).collect();
                let (x, lookups) = net.input_matrix(&rows);
                let acts = net.forward(x);
                let mut grads = net.backward(&acts, &lookups, &y);
                if p.weight_decay > 0.0 {
                    for ((gw, _), layer) in grads.layers.iter_mut().zip(&net.layers) {
                        gw.scaled_add(p.weight_decay, &layer.weights);
                    }
                }
                grads.clip(p.grad_clip);
                adam.update(&mut net, &grads);
            }

            let scores = net.predict_batch(&valid);
            if scores.iter().any(|s| !s.is_finite()) {
                return Err(EnsembleError::training(family, format!("diverged at epoch {epoch}")));
            }
            let auc = roc_auc(&prepared.valid_labels, &scores).unwrap_or(0.5);
            debug!(epoch, auc, "epoch finished");

            if best.as_ref().map_or(true, |(b, _)| auc > *b) {
                best = Some((auc, net.clone()));
                stale = 0;
            } else {
                stale += 1;
                if stale >= p.patience {
                    debug!(epoch, "early stopping");
                    break;
                }
            }
        }

        let model = best.map_or(net, |(_, snapshot)| snapshot);
        let auc = prepared.holdout_auc(family, &model)?;
        info!(layers = model.layers.len(), auc, "trained neural_net");
        Ok((FittedModel::NeuralNet(model), auc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn tiny_net() -> NeuralNet {
        NeuralNet {
            columns: vec!["x".to_string(), "c".to_string()],
            numeric: vec![0],
            scaler: StandardScaler {
                mean: vec![0.0],
                std: vec![1.0],
            },
            embeddings: vec![Embedding {
                column: 1,
                keys: vec![1, 2],
                table: array![[0.0], [1.0], [-1.0]],
            }],
            layers: vec![DenseLayer {
                weights: array![[1.0], [2.0]],
                bias: array![0.0],
            }],
        }
    }

    #[test]
    fn test_scaler_ignores_missing() {
        let rows = vec![vec![1.0], vec![3.0], vec![f64::NAN]];
        let scaler = StandardScaler::fit(&rows, &[0]);
        assert_eq!(scaler.mean, vec![2.0]);
        assert_eq!(scaler.std, vec![1.0]);
        assert_eq!(scaler.transform(0, f64::NAN), 0.0);
        assert_eq!(scaler.transform(0, 3.0), 1.0);
    }

    #[test]
    fn test_scaler_fits_training_rows_only() {
        let features = FeatureSet::default();
        let split = SplitConfig::default();
        let (frame, labels) = crate::synthetic_races(50, 17);
        let augmented = crate::augment::augment(&frame, &features);
        let prepared = Prepared::new(ModelFamily::NeuralNet, &augmented, &labels, &features, &split).unwrap();

        let trainer = NeuralNetTrainer::new(NeuralParams::default(), split);
        let net = trainer.initialise(&prepared, &mut LcgRng::new(1));

        let train_only = StandardScaler::fit(&prepared.train_rows, &net.numeric);
        let all_rows: Vec<Vec<f64>> = prepared
            .train_rows
            .iter()
            .chain(&prepared.valid_rows)
            .cloned()
            .collect();
        let with_holdout = StandardScaler::fit(&all_rows, &net.numeric);

        assert_eq!(net.scaler, train_only);
        assert_ne!(net.scaler, with_holdout);
    }

    #[test]
    fn test_constant_column_keeps_unit_scale() {
        let scaler = StandardScaler::fit(&[vec![5.0], vec![5.0]], &[0]);
        assert_eq!(scaler.std, vec![1.0]);
    }

    #[test]
    fn test_unseen_category_uses_reserved_row() {
        let net = tiny_net();
        let emb = &net.embeddings[0];
        assert_eq!(emb.index(1.0), 1);
        assert_eq!(emb.index(2.0), 2);
        assert_eq!(emb.index(9.0), 0);
        // unseen category contributes nothing
        assert!((net.predict_row(&[0.0, 9.0]) - 0.5).abs() < 1e-12);
        assert!(net.predict_row(&[0.0, 1.0]) > 0.5);
        assert!(net.predict_row(&[0.0, 2.0]) < 0.5);
    }

    #[test]
    fn test_validate_checks_shapes() {
        let mut net = tiny_net();
        assert!(net.validate().is_ok());
        net.layers[0].weights = array![[1.0], [2.0], [3.0]];
        assert!(net.validate().is_err());
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let net = tiny_net();
        let first = [0.5, 1.0];
        let second = [-1.0, 2.0];
        let rows: Vec<&[f64]> = vec![first.as_slice(), second.as_slice()];
        let y = [1.0, 0.0];
        let (x, lookups) = net.input_matrix(&rows);
        let grads = net.backward(&net.forward(x), &lookups, &y);

        let loss = |n: &NeuralNet| {
            let p = n.predict_batch(&rows);
            -(y[0] * p[0].ln() + (1.0 - y[1]) * (1.0 - p[1]).ln()) / 2.0
        };
        let h = 1e-6;
        let mut plus = net.clone();
        plus.layers[0].weights[[0, 0]] += h;
        let mut minus = net.clone();
        minus.layers[0].weights[[0, 0]] -= h;
        let numeric = (loss(&plus) - loss(&minus)) / (2.0 * h);
        assert!((grads.layers[0].0[[0, 0]] - numeric).abs() < 1e-6);
    }

    #[test]
    fn test_clip_bounds_global_norm() {
        let mut grads = Gradients::zeros_like(&tiny_net());
        grads.layers[0].0.fill(10.0);
        grads.clip(1.0);
        assert!((grads.norm() - 1.0).abs() < 1e-9);
    }
}
