//! Aggregation weights derived from held-out AUC

use crate::models::ModelFamily;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Held-out AUC per successfully trained family
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainingStats(BTreeMap<ModelFamily, f64>);

impl TrainingStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, family: ModelFamily, auc: f64) {
        self.0.insert(family, auc);
    }

    pub fn get(&self, family: ModelFamily) -> Option<f64> {
        self.0.get(&family).copied()
    }

    pub fn contains(&self, family: ModelFamily) -> bool {
        self.0.contains_key(&family)
    }

    pub fn families(&self) -> impl Iterator<Item = ModelFamily> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModelFamily, f64)> + '_ {
        self.0.iter().map(|(f, a)| (*f, *a))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Stats restricted to `keep`
    pub fn retain(&self, keep: impl Fn(ModelFamily) -> bool) -> Self {
        Self(self.0.iter().filter(|(f, _)| keep(**f)).map(|(f, a)| (*f, *a)).collect())
    }
}

impl FromIterator<(ModelFamily, f64)> for TrainingStats {
    fn from_iter<I: IntoIterator<Item = (ModelFamily, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Non-negative aggregation weight per family
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WeightVector(BTreeMap<ModelFamily, f64>);

impl WeightVector {
    pub fn get(&self, family: ModelFamily) -> f64 {
        self.0.get(&family).copied().unwrap_or(0.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ModelFamily, f64)> + '_ {
        self.0.iter().map(|(f, w)| (*f, *w))
    }

    pub fn families(&self) -> impl Iterator<Item = ModelFamily> + '_ {
        self.0.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    /// Every weight is finite and non-negative and the total is 1 within `1e-6`
    pub fn is_normalized(&self) -> bool {
        !self.0.is_empty()
            && self.0.values().all(|w| w.is_finite() && *w >= 0.0)
            && (self.total() - 1.0).abs() <= 1e-6
    }
}

impl FromIterator<(ModelFamily, f64)> for WeightVector {
    fn from_iter<I: IntoIterator<Item = (ModelFamily, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Derive weights proportional to held-out AUC.
///
/// AUCs are clamped to `[0, 1]` and non-finite values count as 0. With no
/// stats at all the guaranteed family receives the full weight. If every
/// present family has AUC 0 the weight is split evenly between them.
pub fn optimize(stats: &TrainingStats) -> WeightVector {
    if stats.is_empty() {
        warn!(
            "no training stats, assigning full weight to {}",
            ModelFamily::GUARANTEED
        );
        return WeightVector::from_iter([(ModelFamily::GUARANTEED, 1.0)]);
    }

    let scores: Vec<(ModelFamily, f64)> = stats
        .iter()
        .map(|(family, auc)| {
            let score = if auc.is_finite() { auc.clamp(0.0, 1.0) } else { 0.0 };
            (family, score)
        })
        .collect();
    let total: f64 = scores.iter().map(|(_, s)| s).sum();

    if total <= 0.0 {
        warn!("every family has zero AUC, using uniform weights");
        let uniform = 1.0 / scores.len() as f64;
        return scores.into_iter().map(|(family, _)| (family, uniform)).collect();
    }

    scores
        .into_iter()
        .map(|(family, score)| (family, score / total))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_weights_proportional_to_auc() {
        let stats: TrainingStats = [(ModelFamily::BoostedTreeA, 0.8), (ModelFamily::BoostedTreeB, 0.6)]
            .into_iter()
            .collect();
        let weights = optimize(&stats);
        assert!((weights.get(ModelFamily::BoostedTreeA) - 0.8 / 1.4).abs() < 1e-12);
        assert!((weights.get(ModelFamily::BoostedTreeB) - 0.6 / 1.4).abs() < 1e-12);
        assert!((weights.get(ModelFamily::BoostedTreeA) - 0.571).abs() < 1e-3);
        assert!((weights.get(ModelFamily::BoostedTreeB) - 0.429).abs() < 1e-3);
        assert_eq!(weights.get(ModelFamily::NeuralNet), 0.0);
        assert!(weights.is_normalized());
    }

    #[test]
    fn test_empty_stats_fall_back_to_guaranteed_family() {
        let weights = optimize(&TrainingStats::new());
        assert_eq!(weights.len(), 1);
        assert_eq!(weights.get(ModelFamily::GUARANTEED), 1.0);
    }

    #[test]
    fn test_all_zero_auc_is_uniform() {
        let stats: TrainingStats = [(ModelFamily::RandomForest, 0.0), (ModelFamily::NeuralNet, f64::NAN)]
            .into_iter()
            .collect();
        let weights = optimize(&stats);
        assert_eq!(weights.get(ModelFamily::RandomForest), 0.5);
        assert_eq!(weights.get(ModelFamily::NeuralNet), 0.5);
    }

    #[test]
    fn test_single_family_gets_everything() {
        let stats: TrainingStats = [(ModelFamily::BoostedTreeC, 0.55)].into_iter().collect();
        let weights = optimize(&stats);
        assert_eq!(weights.get(ModelFamily::BoostedTreeC), 1.0);
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let stats: TrainingStats = [(ModelFamily::NeuralNet, 0.7)].into_iter().collect();
        assert_eq!(serde_json::to_string(&stats).unwrap(), r#"{"neural_net":0.7}"#);
    }

    fn family() -> impl Strategy<Value = ModelFamily> {
        prop::sample::select(ModelFamily::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_weights_sum_to_one(entries in prop::collection::vec((family(), -0.5f64..1.5), 0..8)) {
            let stats: TrainingStats = entries.into_iter().collect();
            let weights = optimize(&stats);
            prop_assert!(weights.is_normalized());
            for family in weights.families() {
                prop_assert!(stats.is_empty() || stats.contains(family));
            }
        }
    }
}
