//! Model families combined by the ensemble.
//!
//! Every family implements the same capability: a [`FamilyTrainer`] fits on
//! an augmented frame and reports held-out AUC, and the resulting
//! [`FittedModel`] answers `predict_proba` through its own inference path.
//!
//! | family            | algorithm                               | categorical path            | artifact |
//! |-------------------|-----------------------------------------|-----------------------------|----------|
//! | `boosted_tree_a`  | leaf-wise histogram boosting            | gradient-sorted category sets | JSON   |
//! | `boosted_tree_b`  | depth-wise regularised boosting         | one-vs-rest category splits | JSON     |
//! | `boosted_tree_c`  | oblivious-tree boosting                 | ordered target statistics   | JSON     |
//! | `random_forest`   | bagged Gini trees                       | one-vs-rest category splits | bincode  |
//! | `neural_net`      | feed-forward MLP                        | learned embeddings          | bincode  |

pub mod boosting;
pub(crate) mod cart;
pub mod forest;
pub mod neural;
pub mod oblivious;
pub mod tree;

use crate::config::{EnsembleConfig, SplitConfig};
use crate::deterministic::{holdout_split, HoldoutSplit};
use crate::errors::{EnsembleError, Result};
use crate::features::FeatureSet;
use crate::frame::Frame;
use crate::metrics::roc_auc;
use crate::serde_canon::to_canonical_json;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use boosting::{BoostedTrees, DepthwiseBoostTrainer, DepthwiseParams, LeafwiseBoostTrainer, LeafwiseParams};
pub use forest::{ForestParams, RandomForest, RandomForestTrainer};
pub use neural::{NeuralNet, NeuralNetTrainer, NeuralParams};
pub use oblivious::{ObliviousBoost, ObliviousBoostTrainer, ObliviousParams};

/// Closed set of model families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    BoostedTreeA,
    BoostedTreeB,
    BoostedTreeC,
    RandomForest,
    NeuralNet,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 5] = [
        ModelFamily::BoostedTreeA,
        ModelFamily::BoostedTreeB,
        ModelFamily::BoostedTreeC,
        ModelFamily::RandomForest,
        ModelFamily::NeuralNet,
    ];

    /// Family that receives the fallback weight when no AUC is usable
    pub const GUARANTEED: ModelFamily = ModelFamily::BoostedTreeA;

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::BoostedTreeA => "boosted_tree_a",
            ModelFamily::BoostedTreeB => "boosted_tree_b",
            ModelFamily::BoostedTreeC => "boosted_tree_c",
            ModelFamily::RandomForest => "random_forest",
            ModelFamily::NeuralNet => "neural_net",
        }
    }

    /// File name of this family's artifact inside a saved ensemble directory
    pub fn artifact_file(&self) -> &'static str {
        match self {
            ModelFamily::BoostedTreeA => "boosted_tree_a.json",
            ModelFamily::BoostedTreeB => "boosted_tree_b.json",
            ModelFamily::BoostedTreeC => "boosted_tree_c.json",
            ModelFamily::RandomForest => "random_forest.bin",
            ModelFamily::NeuralNet => "neural_net.bin",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = EnsembleError;

    fn from_str(s: &str) -> Result<Self> {
        ModelFamily::ALL
            .into_iter()
            .find(|family| family.as_str() == s.trim())
            .ok_or_else(|| EnsembleError::Configuration(format!("unknown model family '{s}'")))
    }
}

/// Inference capability shared by every fitted family
pub trait Classifier {
    /// Column order the model was trained on
    fn columns(&self) -> &[String];

    /// Probability of the positive class for one row in `columns()` order
    fn predict_row(&self, row: &[f64]) -> f64;

    /// Probability per row of an augmented frame, in row order
    fn predict_proba(&self, frame: &Frame) -> Result<Vec<f64>> {
        let rows = frame.row_major(self.columns())?;
        Ok(rows.iter().map(|row| self.predict_row(row)).collect())
    }
}

/// Training capability shared by every family
pub trait FamilyTrainer: Send + Sync {
    fn family(&self) -> ModelFamily;

    /// Fit on an augmented frame and return the model with its held-out AUC
    fn train(&self, frame: &Frame, labels: &[u8], features: &FeatureSet) -> Result<(FittedModel, f64)>;
}

/// A fitted model of one family
#[derive(Debug, Clone, PartialEq)]
pub enum FittedModel {
    BoostedTreeA(BoostedTrees),
    BoostedTreeB(BoostedTrees),
    BoostedTreeC(ObliviousBoost),
    RandomForest(RandomForest),
    NeuralNet(NeuralNet),
}

impl FittedModel {
    pub fn family(&self) -> ModelFamily {
        match self {
            FittedModel::BoostedTreeA(_) => ModelFamily::BoostedTreeA,
            FittedModel::BoostedTreeB(_) => ModelFamily::BoostedTreeB,
            FittedModel::BoostedTreeC(_) => ModelFamily::BoostedTreeC,
            FittedModel::RandomForest(_) => ModelFamily::RandomForest,
            FittedModel::NeuralNet(_) => ModelFamily::NeuralNet,
        }
    }

    pub fn as_classifier(&self) -> &dyn Classifier {
        match self {
            FittedModel::BoostedTreeA(m) | FittedModel::BoostedTreeB(m) => m,
            FittedModel::BoostedTreeC(m) => m,
            FittedModel::RandomForest(m) => m,
            FittedModel::NeuralNet(m) => m,
        }
    }

    pub fn columns(&self) -> &[String] {
        self.as_classifier().columns()
    }

    pub fn predict_proba(&self, frame: &Frame) -> Result<Vec<f64>> {
        self.as_classifier().predict_proba(frame)
    }

    /// Serialize with the family's own artifact format
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            FittedModel::BoostedTreeA(m) | FittedModel::BoostedTreeB(m) => {
                m.ensure_finite()?;
                to_canonical_json(m)?.into_bytes()
            }
            FittedModel::BoostedTreeC(m) => {
                m.ensure_finite()?;
                to_canonical_json(m)?.into_bytes()
            }
            FittedModel::RandomForest(m) => bincode::serialize(m)?,
            FittedModel::NeuralNet(m) => bincode::serialize(m)?,
        };
        Ok(bytes)
    }

    /// Inverse of [`FittedModel::encode`]; structural validation included
    pub fn decode(family: ModelFamily, bytes: &[u8]) -> Result<Self> {
        let model = match family {
            ModelFamily::BoostedTreeA => FittedModel::BoostedTreeA(serde_json::from_slice(bytes)?),
            ModelFamily::BoostedTreeB => FittedModel::BoostedTreeB(serde_json::from_slice(bytes)?),
            ModelFamily::BoostedTreeC => FittedModel::BoostedTreeC(serde_json::from_slice(bytes)?),
            ModelFamily::RandomForest => FittedModel::RandomForest(bincode::deserialize(bytes)?),
            ModelFamily::NeuralNet => FittedModel::NeuralNet(bincode::deserialize(bytes)?),
        };
        model.validate()?;
        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        let outcome = match self {
            FittedModel::BoostedTreeA(m) | FittedModel::BoostedTreeB(m) => m.validate(),
            FittedModel::BoostedTreeC(m) => m.validate(),
            FittedModel::RandomForest(m) => m.validate(),
            FittedModel::NeuralNet(m) => m.validate(),
        };
        outcome.map_err(|reason| EnsembleError::persistence(self.family().as_str(), reason))
    }
}

/// One trainer per requested family, configured from `config`
pub fn trainers_for(config: &EnsembleConfig) -> Vec<Box<dyn FamilyTrainer>> {
    config
        .families
        .iter()
        .map(|&family| trainer_for(family, config))
        .collect()
}

pub fn trainer_for(family: ModelFamily, config: &EnsembleConfig) -> Box<dyn FamilyTrainer> {
    let split = config.split.clone();
    match family {
        ModelFamily::BoostedTreeA => Box::new(LeafwiseBoostTrainer::new(config.boosted_tree_a.clone(), split)),
        ModelFamily::BoostedTreeB => Box::new(DepthwiseBoostTrainer::new(config.boosted_tree_b.clone(), split)),
        ModelFamily::BoostedTreeC => Box::new(ObliviousBoostTrainer::new(config.boosted_tree_c.clone(), split)),
        ModelFamily::RandomForest => Box::new(RandomForestTrainer::new(config.random_forest.clone(), split)),
        ModelFamily::NeuralNet => Box::new(NeuralNetTrainer::new(config.neural_net.clone(), split)),
    }
}

/// Model-ordered training data with the held-out rows already reserved
pub(crate) struct Prepared {
    pub columns: Vec<String>,
    pub categorical: Vec<bool>,
    pub train_rows: Vec<Vec<f64>>,
    pub train_labels: Vec<u8>,
    pub valid_rows: Vec<Vec<f64>>,
    pub valid_labels: Vec<u8>,
}

impl Prepared {
    /// Reserve the holdout before anything is fitted and check both sides are usable
    pub fn new(
        family: ModelFamily,
        frame: &Frame,
        labels: &[u8],
        features: &FeatureSet,
        split: &SplitConfig,
    ) -> Result<Self> {
        if labels.len() != frame.n_rows() {
            return Err(EnsembleError::training(
                family,
                format!("{} labels for {} rows", labels.len(), frame.n_rows()),
            ));
        }

        let columns = features.model_columns();
        let rows = frame
            .row_major(&columns)
            .map_err(|e| EnsembleError::training(family, e.to_string()))?;

        let HoldoutSplit { train, validation } =
            holdout_split(frame, &features.race_key, split.validation_fraction, split.seed);

        if train.len() < split.min_train_rows {
            return Err(EnsembleError::training(
                family,
                format!("insufficient data: {} training rows, need {}", train.len(), split.min_train_rows),
            ));
        }
        if validation.is_empty() {
            return Err(EnsembleError::training(family, "holdout set is empty"));
        }

        let pick = |idx: &[usize]| -> (Vec<Vec<f64>>, Vec<u8>) {
            (
                idx.iter().map(|&i| rows[i].clone()).collect(),
                idx.iter().map(|&i| labels[i]).collect(),
            )
        };
        let (train_rows, train_labels) = pick(&train);
        let (valid_rows, valid_labels) = pick(&validation);

        for (side, side_labels) in [("training", &train_labels), ("holdout", &valid_labels)] {
            let positives = side_labels.iter().filter(|&&y| y == 1).count();
            if positives == 0 || positives == side_labels.len() {
                return Err(EnsembleError::training(
                    family,
                    format!("degenerate label distribution in {side} rows"),
                ));
            }
        }

        Ok(Self {
            categorical: features.categorical_mask(),
            columns,
            train_rows,
            train_labels,
            valid_rows,
            valid_labels,
        })
    }

    /// AUC of `model` on the reserved rows
    pub fn holdout_auc(&self, family: ModelFamily, model: &dyn Classifier) -> Result<f64> {
        let scores: Vec<f64> = self.valid_rows.iter().map(|row| model.predict_row(row)).collect();
        if scores.iter().any(|p| !p.is_finite()) {
            return Err(EnsembleError::training(family, "non-finite holdout predictions"));
        }
        roc_auc(&self.valid_labels, &scores)
            .ok_or_else(|| EnsembleError::training(family, "holdout AUC undefined"))
    }
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}
