//! Shared handle to the ensemble currently used for serving
//!
//! The serving boundary owns one `EnsembleHandle` and clones it into every
//! request path. Readers take a snapshot `Arc<Ensemble>` and predict without
//! holding the lock; a reload builds a complete new ensemble first and then
//! swaps the reference, so in-flight predictions finish on the old one.

use crate::ensemble::Ensemble;
use crate::errors::{EnsembleError, Result};
use crate::features::FeatureSet;
use crate::frame::Frame;
use crate::persistence;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone, Default)]
pub struct EnsembleHandle {
    current: Arc<RwLock<Option<Arc<Ensemble>>>>,
}

impl EnsembleHandle {
    pub fn new(ensemble: Ensemble) -> Self {
        Self {
            current: Arc::new(RwLock::new(Some(Arc::new(ensemble)))),
        }
    }

    /// A handle with nothing loaded yet
    pub fn empty() -> Self {
        Self::default()
    }

    /// Snapshot of the current ensemble
    pub fn current(&self) -> Option<Arc<Ensemble>> {
        self.current.read().clone()
    }

    /// Replace the current ensemble, returning the previous one
    pub fn swap(&self, ensemble: Ensemble) -> Option<Arc<Ensemble>> {
        self.current.write().replace(Arc::new(ensemble))
    }

    /// Load from `dir` and swap it in; the current ensemble stays on failure
    pub fn reload_from(&self, dir: &Path) -> Result<()> {
        let expected = self.current().map(|e| e.feature_set().clone());
        let loaded = match &expected {
            Some(contract) => persistence::load_with_contract(dir, contract),
            None => persistence::load(dir),
        };

        match loaded {
            Ok(ensemble) => {
                let families: Vec<_> = ensemble.families().collect();
                self.swap(ensemble);
                info!("Swapped in ensemble from {} with {:?}", dir.display(), families);
                Ok(())
            }
            Err(e) => {
                warn!("Reload from {} failed, keeping current ensemble: {}", dir.display(), e);
                Err(e)
            }
        }
    }

    pub fn predict(&self, frame: &Frame) -> Result<Vec<f64>> {
        let ensemble = self.current().ok_or(EnsembleError::NotFitted)?;
        ensemble.predict(frame)
    }

    pub fn feature_set(&self) -> Option<FeatureSet> {
        self.current().map(|e| e.feature_set().clone())
    }
}
