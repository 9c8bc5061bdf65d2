//! Feature contract shared by training and inference.
//!
//! The contract is configuration: an ordered list of base columns, the subset
//! that is categorical, and the columns that identify a single race. Every
//! family is trained on `base ++ augment::DERIVED_FEATURES` in exactly this
//! order.

use crate::augment::DERIVED_FEATURES;
use crate::errors::{EnsembleError, Result};
use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Base columns of the boat race contract
pub const BASE_FEATURES: [&str; 16] = [
    "jyo_cd",
    "boat_no",
    "racer_win_rate",
    "motor_2ren",
    "boat_2ren",
    "exhibition_time",
    "tilt",
    "temperature",
    "water_temperature",
    "wind_speed",
    "wave_height",
    "wind_direction",
    "weather",
    "racer_win_rate_diff",
    "motor_2ren_diff",
    "exhibition_time_diff",
];

/// Base columns carried as integer category codes
pub const CATEGORICAL_FEATURES: [&str; 4] = ["jyo_cd", "boat_no", "wind_direction", "weather"];

/// Columns that together identify one race
pub const RACE_KEY: [&str; 3] = ["date", "jyo_cd", "race_no"];

/// Ordered base columns plus the categorical subset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    /// Base columns, in model order
    pub base: Vec<String>,
    /// Subset of `base` handled as categories
    pub categorical: Vec<String>,
    /// Columns grouping entrants into races (need not be model inputs)
    #[serde(default)]
    pub race_key: Vec<String>,
}

impl FeatureSet {
    /// Create a validated feature set
    pub fn new(base: Vec<String>, categorical: Vec<String>, race_key: Vec<String>) -> Result<Self> {
        let set = Self {
            base,
            categorical,
            race_key,
        };
        set.validate()?;
        Ok(set)
    }

    /// Check internal consistency of the contract
    pub fn validate(&self) -> Result<()> {
        if self.base.is_empty() {
            return Err(EnsembleError::Configuration(
                "feature set has no base columns".into(),
            ));
        }

        let mut seen = BTreeSet::new();
        for name in &self.base {
            if !seen.insert(name.as_str()) {
                return Err(EnsembleError::Configuration(format!(
                    "duplicate base column '{name}'"
                )));
            }
            if DERIVED_FEATURES.contains(&name.as_str()) {
                return Err(EnsembleError::Configuration(format!(
                    "base column '{name}' collides with a derived feature"
                )));
            }
        }

        for name in &self.categorical {
            if !seen.contains(name.as_str()) {
                return Err(EnsembleError::Configuration(format!(
                    "categorical column '{name}' is not a base column"
                )));
            }
        }

        Ok(())
    }

    pub fn is_categorical(&self, name: &str) -> bool {
        self.categorical.iter().any(|c| c == name)
    }

    /// Fail with a feature mismatch if any base column is absent
    pub fn check_frame(&self, frame: &Frame) -> Result<()> {
        let missing = frame.missing_columns(&self.base);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(EnsembleError::FeatureMismatch { missing })
        }
    }

    /// Race-key columns absent from `frame`; group statistics fall back to neutral values without them
    pub fn missing_race_key(&self, frame: &Frame) -> Vec<String> {
        frame.missing_columns(&self.race_key)
    }

    /// Columns every family consumes: base columns then derived ones
    pub fn model_columns(&self) -> Vec<String> {
        self.base
            .iter()
            .cloned()
            .chain(DERIVED_FEATURES.iter().map(|s| s.to_string()))
            .collect()
    }

    /// Categorical flag per entry of [`FeatureSet::model_columns`]
    pub fn categorical_mask(&self) -> Vec<bool> {
        self.model_columns()
            .iter()
            .map(|name| self.is_categorical(name))
            .collect()
    }

    /// Fail with a configuration error unless `other` is the same contract
    pub fn ensure_matches(&self, other: &FeatureSet) -> Result<()> {
        if self == other {
            return Ok(());
        }
        Err(EnsembleError::Configuration(format!(
            "feature contract mismatch: expected {:?} (categorical {:?}), found {:?} (categorical {:?})",
            self.base, self.categorical, other.base, other.categorical
        )))
    }
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self {
            base: BASE_FEATURES.iter().map(|s| s.to_string()).collect(),
            categorical: CATEGORICAL_FEATURES.iter().map(|s| s.to_string()).collect(),
            race_key: RACE_KEY.iter().map(|s| s.to_string()).collect(),
        }
    }
}
