//! Weighted multi-model ensemble for boat race win probabilities
//!
//! Five independent binary classifiers are trained on the same augmented
//! feature contract and blended with weights proportional to their held-out
//! AUC. The fitted ensemble persists to a directory and can be hot-swapped
//! behind a shared handle for serving.
//!
//! Modules:
//! - `features`: Column contract shared by training and inference
//! - `augment`: Deterministic derived features
//! - `models`: The five model families and their trainers
//! - `weights`: AUC-proportional weight derivation
//! - `ensemble`: Training orchestration and weighted prediction
//! - `persistence`: Directory format with hashed artifacts
//! - `serving`: Hot-swappable handle for concurrent readers
//! - `config`: TOML configuration with environment overrides
//! - `synthetic`: Deterministic race cards for smoke runs

pub mod augment;
pub mod config;
pub mod deterministic;
pub mod ensemble;
pub mod errors;
pub mod features;
pub mod frame;
pub mod metrics;
pub mod models;
pub mod persistence;
pub mod serde_canon;
pub mod serving;
pub mod synthetic;
pub mod weights;

pub use augment::{augment, DERIVED_FEATURES};
pub use config::{EnsembleConfig, SplitConfig};
pub use ensemble::{Ensemble, PredictionDetails, TrainingReport};
pub use errors::{EnsembleError, Result};
pub use features::FeatureSet;
pub use frame::Frame;
pub use models::{Classifier, FamilyTrainer, FittedModel, ModelFamily};
pub use serving::EnsembleHandle;
pub use synthetic::{synthetic_races, SyntheticRaces};
pub use weights::{optimize, TrainingStats, WeightVector};

/// Crate version string recorded in saved metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
