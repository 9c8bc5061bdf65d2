//! Error types for the ensemble engine

use crate::models::ModelFamily;
use crate::serde_canon::CanonicalError;
use thiserror::Error;

/// Errors that can occur while training, predicting with, or persisting an ensemble
#[derive(Error, Debug)]
pub enum EnsembleError {
    /// Invalid configuration, contract mismatch, or unusable destination
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Required base columns are absent from the input frame
    #[error("Feature mismatch: missing required columns {missing:?}")]
    FeatureMismatch { missing: Vec<String> },

    /// A single model family failed to fit
    #[error("Training failed for {family}: {reason}")]
    TrainingFailure { family: ModelFamily, reason: String },

    /// Every requested family failed during a training pass
    #[error("No model family could be trained: {0}")]
    NoViableFamily(String),

    /// Predict or save called before any family was trained or loaded
    #[error("Ensemble is not fitted")]
    NotFitted,

    /// An artifact is missing or corrupt
    #[error("Persistence error ({artifact}): {reason}")]
    Persistence { artifact: String, reason: String },

    /// No family produced a usable probability vector
    #[error("Prediction failed: {0}")]
    PredictionFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EnsembleError {
    pub(crate) fn training(family: ModelFamily, reason: impl Into<String>) -> Self {
        EnsembleError::TrainingFailure {
            family,
            reason: reason.into(),
        }
    }

    pub(crate) fn persistence(artifact: impl Into<String>, reason: impl ToString) -> Self {
        EnsembleError::Persistence {
            artifact: artifact.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for EnsembleError {
    fn from(err: serde_json::Error) -> Self {
        EnsembleError::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for EnsembleError {
    fn from(err: bincode::Error) -> Self {
        EnsembleError::Serialization(err.to_string())
    }
}

impl From<CanonicalError> for EnsembleError {
    fn from(err: CanonicalError) -> Self {
        EnsembleError::Serialization(err.to_string())
    }
}

/// Result type for ensemble operations
pub type Result<T> = std::result::Result<T, EnsembleError>;
