//! The weighted ensemble: training pass, aggregation, and lifecycle state

use crate::augment::augment;
use crate::config::EnsembleConfig;
use crate::errors::{EnsembleError, Result};
use crate::features::FeatureSet;
use crate::frame::Frame;
use crate::models::{trainers_for, FamilyTrainer, FittedModel, ModelFamily};
use crate::persistence;
use crate::weights::{optimize, TrainingStats, WeightVector};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{info, instrument, warn};

/// Lower bound applied to every family probability before weighting
pub const PROBABILITY_FLOOR: f64 = 0.01;
/// Upper bound applied to every family probability before weighting
pub const PROBABILITY_CEILING: f64 = 0.99;
/// Confidence reported when families disagree strongly or only one contributed
pub const MIN_CONFIDENCE: f64 = 0.1;

/// Outcome of one training pass
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub trained: Vec<ModelFamily>,
    /// Families that failed, with the reason
    pub failures: BTreeMap<ModelFamily, String>,
    pub training_stats: TrainingStats,
    pub weights: WeightVector,
}

/// Ensemble output with the per-family breakdown
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionDetails {
    pub probabilities: Vec<f64>,
    /// Clipped probabilities of every family that produced output
    pub per_family: BTreeMap<ModelFamily, Vec<f64>>,
    /// Weights applied to the families in `per_family`
    pub weights: WeightVector,
    /// `max(0.1, 1 - std)` of the family probabilities, per row
    pub confidence: Vec<f64>,
}

/// A set of fitted families plus their aggregation weights
#[derive(Debug, Clone)]
pub struct Ensemble {
    feature_set: FeatureSet,
    models: BTreeMap<ModelFamily, FittedModel>,
    weights: WeightVector,
    training_stats: TrainingStats,
    is_fitted: bool,
    created_at: DateTime<Utc>,
}

impl Default for Ensemble {
    fn default() -> Self {
        Self::new(FeatureSet::default())
    }
}

impl Ensemble {
    /// An empty, unfitted ensemble bound to a feature contract
    pub fn new(feature_set: FeatureSet) -> Self {
        Self {
            feature_set,
            models: BTreeMap::new(),
            weights: WeightVector::default(),
            training_stats: TrainingStats::new(),
            is_fitted: false,
            created_at: Utc::now(),
        }
    }

    pub(crate) fn from_parts(
        feature_set: FeatureSet,
        models: BTreeMap<ModelFamily, FittedModel>,
        weights: WeightVector,
        training_stats: TrainingStats,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            feature_set,
            is_fitted: !models.is_empty(),
            models,
            weights,
            training_stats,
            created_at,
        }
    }

    pub fn feature_set(&self) -> &FeatureSet {
        &self.feature_set
    }

    pub fn weights(&self) -> &WeightVector {
        &self.weights
    }

    pub fn training_stats(&self) -> &TrainingStats {
        &self.training_stats
    }

    pub fn is_fitted(&self) -> bool {
        self.is_fitted && !self.models.is_empty()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn families(&self) -> impl Iterator<Item = ModelFamily> + '_ {
        self.models.keys().copied()
    }

    pub fn model(&self, family: ModelFamily) -> Option<&FittedModel> {
        self.models.get(&family)
    }

    pub(crate) fn models(&self) -> &BTreeMap<ModelFamily, FittedModel> {
        &self.models
    }

    /// Train every family selected in `config`
    pub fn train(&mut self, frame: &Frame, labels: &[u8], config: &EnsembleConfig) -> Result<TrainingReport> {
        config.validate()?;
        self.feature_set.ensure_matches(&config.features)?;
        self.train_with(frame, labels, trainers_for(config))
    }

    /// Train with explicit trainers.
    ///
    /// A family that fails is reported and left out; the pass only fails when
    /// no family trains. On failure the previous state is kept.
    #[instrument(skip_all, fields(rows = frame.n_rows(), families = trainers.len()))]
    pub fn train_with(
        &mut self,
        frame: &Frame,
        labels: &[u8],
        trainers: Vec<Box<dyn FamilyTrainer>>,
    ) -> Result<TrainingReport> {
        if labels.len() != frame.n_rows() {
            return Err(EnsembleError::Configuration(format!(
                "{} labels for {} rows",
                labels.len(),
                frame.n_rows()
            )));
        }
        if labels.iter().any(|&y| y > 1) {
            return Err(EnsembleError::Configuration("labels must be 0 or 1".to_string()));
        }
        let mut requested = BTreeSet::new();
        if let Some(dup) = trainers.iter().map(|t| t.family()).find(|f| !requested.insert(*f)) {
            return Err(EnsembleError::Configuration(format!("{dup} requested twice")));
        }
        self.feature_set.check_frame(frame)?;

        let augmented = augment(frame, &self.feature_set);
        let expected_columns = self.feature_set.model_columns();

        let mut models = BTreeMap::new();
        let mut stats = TrainingStats::new();
        let mut failures = BTreeMap::new();

        for trainer in &trainers {
            let family = trainer.family();
            info!("Training {}", family);
            let outcome = trainer
                .train(&augmented, labels, &self.feature_set)
                .and_then(|(model, auc)| {
                    if model.family() != family {
                        Err(EnsembleError::training(family, format!("trainer returned a {} model", model.family())))
                    } else if model.columns() != expected_columns.as_slice() {
                        Err(EnsembleError::training(family, "model column order differs from the feature contract"))
                    } else {
                        Ok((model, auc))
                    }
                });

            match outcome {
                Ok((model, auc)) => {
                    info!("{} validation AUC: {:.4}", family, auc);
                    models.insert(family, model);
                    stats.insert(family, auc);
                }
                Err(e) => {
                    warn!("{} training failed, leaving it out: {}", family, e);
                    failures.insert(family, e.to_string());
                }
            }
        }

        if models.is_empty() {
            let summary = failures
                .iter()
                .map(|(f, reason)| format!("{f}: {reason}"))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EnsembleError::NoViableFamily(summary));
        }

        let weights = optimize(&stats);
        info!("Ensemble weights: {:?}", weights);

        self.models = models;
        self.training_stats = stats.clone();
        self.weights = weights.clone();
        self.is_fitted = true;
        self.created_at = Utc::now();

        Ok(TrainingReport {
            trained: self.models.keys().copied().collect(),
            failures,
            training_stats: stats,
            weights,
        })
    }

    /// Ensemble probability per row, in input order
    pub fn predict(&self, frame: &Frame) -> Result<Vec<f64>> {
        self.predict_with_details(frame).map(|d| d.probabilities)
    }

    /// Ensemble probability plus per-family output and agreement confidence
    pub fn predict_with_details(&self, frame: &Frame) -> Result<PredictionDetails> {
        if !self.is_fitted() {
            return Err(EnsembleError::NotFitted);
        }
        self.feature_set.check_frame(frame)?;
        let missing_key = self.feature_set.missing_race_key(frame);
        if !missing_key.is_empty() {
            warn!(
                "race key columns {:?} missing, race-group features fall back to neutral values",
                missing_key
            );
        }

        let augmented = augment(frame, &self.feature_set);
        let n = frame.n_rows();

        let mut per_family = BTreeMap::new();
        let mut used = Vec::new();
        for (&family, model) in &self.models {
            let weight = self.weights.get(family);
            match model.predict_proba(&augmented) {
                Ok(p) if p.len() == n && p.iter().all(|v| v.is_finite()) => {
                    let clipped: Vec<f64> = p
                        .into_iter()
                        .map(|v| v.clamp(PROBABILITY_FLOOR, PROBABILITY_CEILING))
                        .collect();
                    per_family.insert(family, clipped);
                    used.push((family, weight));
                }
                Ok(_) => warn!("{} produced unusable output, skipping it", family),
                Err(e) => warn!("{} inference failed, skipping it: {}", family, e),
            }
        }

        let contributing: f64 = used.iter().map(|(_, w)| w).sum();
        if contributing <= 0.0 {
            return Err(EnsembleError::PredictionFailed(
                "no family with positive weight produced output".to_string(),
            ));
        }

        let mut probabilities = vec![0.0; n];
        for (family, weight) in &used {
            for (acc, p) in probabilities.iter_mut().zip(&per_family[family]) {
                *acc += weight * p;
            }
        }

        let confidence = (0..n)
            .map(|row| {
                let values: Vec<f64> = per_family.values().map(|p| p[row]).collect();
                agreement(&values)
            })
            .collect();

        Ok(PredictionDetails {
            probabilities,
            per_family,
            weights: used.into_iter().collect(),
            confidence,
        })
    }

    /// Write to `dir`; see [`persistence::save`]
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
        persistence::save(self, dir.as_ref())
    }

    /// Read from `dir`; see [`persistence::load`]
    pub fn load<P: AsRef<Path>>(dir: P) -> Result<Self> {
        persistence::load(dir.as_ref())
    }
}

/// `max(0.1, 1 - population std)`, or 0.1 with fewer than two values
fn agreement(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return MIN_CONFIDENCE;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (1.0 - var.sqrt()).max(MIN_CONFIDENCE)
}
