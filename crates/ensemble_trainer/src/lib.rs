//! Offline trainer for the boat race ensemble
//!
//! Loads a CSV race history, trains every configured family and writes the
//! ensemble directory that the serving side loads.

pub mod dataset;
pub mod errors;

use boatrace_ensemble_core::{Ensemble, EnsembleConfig, TrainingReport};
use std::path::Path;
use tracing::info;

pub use dataset::{Dataset, FeatureStats, LabelSource};
pub use errors::TrainerError;

/// Train an ensemble directly from a CSV file using the provided configuration.
pub fn train_from_csv(
    path: &Path,
    label: &LabelSource,
    config: &EnsembleConfig,
) -> Result<(Ensemble, TrainingReport), TrainerError> {
    let dataset = Dataset::from_csv(path, &config.features, label)
        .map_err(|err| TrainerError::Dataset(format!("{err:#}")))?;
    train_dataset(&dataset, config)
}

/// Train an ensemble on an already loaded dataset
pub fn train_dataset(dataset: &Dataset, config: &EnsembleConfig) -> Result<(Ensemble, TrainingReport), TrainerError> {
    info!(
        "Training on {} rows ({} winners)",
        dataset.len(),
        dataset.positives()
    );
    let mut ensemble = Ensemble::new(config.features.clone());
    let report = ensemble
        .train(&dataset.frame, &dataset.labels, config)
        .map_err(|err| TrainerError::Training(err.to_string()))?;
    Ok((ensemble, report))
}

/// Train from `input` and save the result under `output`
pub fn train_and_save(
    input: &Path,
    output: &Path,
    label: &LabelSource,
    config: &EnsembleConfig,
) -> Result<TrainingReport, TrainerError> {
    let (ensemble, report) = train_from_csv(input, label, config)?;
    ensemble
        .save(output)
        .map_err(|err| TrainerError::Save(err.to_string()))?;
    Ok(report)
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
