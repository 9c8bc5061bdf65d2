//! Saving and restoring an ensemble as one directory
//!
//! Layout:
//! - `ensemble_metadata.json`: feature contract, weights, stats, timestamps,
//!   and the file name and BLAKE3 hash of every family artifact
//! - one artifact per fitted family, named by [`ModelFamily::artifact_file`]
//!
//! Artifacts are written before the metadata and every file goes through a
//! temporary name and a rename, so no single file is ever read half written.
//! Saving over an existing directory is not atomic as a whole: a crash between
//! the artifact and metadata writes leaves the old metadata next to new
//! artifacts, and `load` then drops the families whose hashes no longer match.
//!
//! The metadata itself is not hashed. On load the weights are always re-derived
//! from the recorded training stats and a stored vector that disagrees is
//! rejected.

use crate::ensemble::Ensemble;
use crate::errors::{EnsembleError, Result};
use crate::features::FeatureSet;
use crate::models::{FittedModel, ModelFamily};
use crate::serde_canon::{ensure_finite, hash_bytes_hex, to_canonical_json_pretty};
use crate::weights::{optimize, TrainingStats, WeightVector};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

pub const METADATA_FILE: &str = "ensemble_metadata.json";
pub const FORMAT_VERSION: u32 = 1;

const WEIGHT_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub file: String,
    pub blake3: String,
}

/// Contents of `ensemble_metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleMetadata {
    pub format_version: u32,
    pub library_version: String,
    pub feature_set: FeatureSet,
    pub weights: WeightVector,
    pub training_stats: TrainingStats,
    pub is_fitted: bool,
    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    pub artifacts: BTreeMap<ModelFamily, ArtifactEntry>,
}

/// Write `ensemble` to `dir`, creating it if needed
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn save(ensemble: &Ensemble, dir: &Path) -> Result<()> {
    if !ensemble.is_fitted() {
        return Err(EnsembleError::NotFitted);
    }
    if dir.exists() && !dir.is_dir() {
        return Err(EnsembleError::Configuration(format!(
            "{} exists and is not a directory",
            dir.display()
        )));
    }
    fs::create_dir_all(dir)?;

    ensure_finite("weights", ensemble.weights().iter().map(|(_, w)| w))?;
    ensure_finite("training stats", ensemble.training_stats().iter().map(|(_, a)| a))?;

    let mut artifacts = BTreeMap::new();
    for (&family, model) in ensemble.models() {
        let bytes = model
            .encode()
            .map_err(|e| EnsembleError::persistence(family.as_str(), e))?;
        let file = family.artifact_file();
        write_atomic(&dir.join(file), &bytes)?;
        artifacts.insert(
            family,
            ArtifactEntry {
                file: file.to_string(),
                blake3: hash_bytes_hex(&bytes),
            },
        );
    }

    let metadata = EnsembleMetadata {
        format_version: FORMAT_VERSION,
        library_version: crate::VERSION.to_string(),
        feature_set: ensemble.feature_set().clone(),
        weights: ensemble.weights().clone(),
        training_stats: ensemble.training_stats().clone(),
        is_fitted: true,
        created_at: ensemble.created_at(),
        saved_at: Utc::now(),
        artifacts,
    };
    let json = to_canonical_json_pretty(&metadata)?;
    write_atomic(&dir.join(METADATA_FILE), json.as_bytes())?;

    info!(
        families = metadata.artifacts.len(),
        "Saved ensemble to {}",
        dir.display()
    );
    Ok(())
}

/// Read and check `ensemble_metadata.json` in `dir`
pub fn read_metadata(dir: &Path) -> Result<EnsembleMetadata> {
    let path = dir.join(METADATA_FILE);
    let content = fs::read_to_string(&path).map_err(|e| EnsembleError::persistence(METADATA_FILE, e))?;
    let metadata: EnsembleMetadata =
        serde_json::from_str(&content).map_err(|e| EnsembleError::persistence(METADATA_FILE, e))?;

    if metadata.format_version != FORMAT_VERSION {
        return Err(EnsembleError::persistence(
            METADATA_FILE,
            format!(
                "unsupported format version {} (expected {})",
                metadata.format_version, FORMAT_VERSION
            ),
        ));
    }
    metadata
        .feature_set
        .validate()
        .map_err(|e| EnsembleError::persistence(METADATA_FILE, e))?;
    Ok(metadata)
}

/// Restore an ensemble from `dir`.
///
/// A family whose artifact is missing or unusable is dropped with a warning
/// and the weights are re-derived from the remaining families' stats. Fails
/// with `NotFitted` when no family survives.
#[instrument(skip_all, fields(dir = %dir.display()))]
pub fn load(dir: &Path) -> Result<Ensemble> {
    let metadata = read_metadata(dir)?;
    restore(dir, metadata)
}

/// [`load`], rejecting a directory saved under a different feature contract
pub fn load_with_contract(dir: &Path, expected: &FeatureSet) -> Result<Ensemble> {
    let metadata = read_metadata(dir)?;
    expected.ensure_matches(&metadata.feature_set)?;
    restore(dir, metadata)
}

fn restore(dir: &Path, metadata: EnsembleMetadata) -> Result<Ensemble> {
    if !metadata.is_fitted {
        return Err(EnsembleError::NotFitted);
    }
    let expected_columns = metadata.feature_set.model_columns();

    let mut models = BTreeMap::new();
    for (&family, entry) in &metadata.artifacts {
        match load_artifact(dir, family, entry, &expected_columns) {
            Ok(model) => {
                models.insert(family, model);
            }
            Err(e) => warn!("Dropping {}: {}", family, e),
        }
    }

    if models.is_empty() {
        warn!("No usable artifact in {}", dir.display());
        return Err(EnsembleError::NotFitted);
    }

    let recorded: BTreeSet<ModelFamily> = metadata
        .weights
        .families()
        .chain(metadata.training_stats.families())
        .chain(metadata.artifacts.keys().copied())
        .collect();
    let dropped: Vec<ModelFamily> = recorded.into_iter().filter(|f| !models.contains_key(f)).collect();

    let training_stats = metadata.training_stats.retain(|f| models.contains_key(&f));
    if dropped.is_empty() && training_stats.len() != models.len() {
        return Err(EnsembleError::persistence(
            METADATA_FILE,
            "training stats do not cover every artifact",
        ));
    }

    let weights: WeightVector = if training_stats.is_empty() {
        let uniform = 1.0 / models.len() as f64;
        models.keys().map(|&f| (f, uniform)).collect()
    } else {
        optimize(&training_stats)
    };

    if dropped.is_empty() {
        check_stored_weights(&metadata.weights, &weights)?;
    } else {
        warn!("Re-deriving weights without {:?}", dropped);
    }

    info!(
        families = models.len(),
        dropped = dropped.len(),
        "Loaded ensemble from {}",
        dir.display()
    );
    Ok(Ensemble::from_parts(
        metadata.feature_set,
        models,
        weights,
        training_stats,
        metadata.created_at,
    ))
}

/// Stored weights must be normalised and agree with the ones derived from the stats
fn check_stored_weights(stored: &WeightVector, derived: &WeightVector) -> Result<()> {
    if !stored.is_normalized() {
        return Err(EnsembleError::persistence(
            METADATA_FILE,
            format!("stored weights are not normalised (total {})", stored.total()),
        ));
    }
    let agrees = stored.families().eq(derived.families())
        && stored
            .iter()
            .all(|(family, w)| (w - derived.get(family)).abs() <= WEIGHT_TOLERANCE);
    if !agrees {
        return Err(EnsembleError::persistence(
            METADATA_FILE,
            "stored weights disagree with the recorded training stats",
        ));
    }
    Ok(())
}

fn load_artifact(dir: &Path, family: ModelFamily, entry: &ArtifactEntry, columns: &[String]) -> Result<FittedModel> {
    if Path::new(&entry.file).components().count() != 1 {
        return Err(EnsembleError::persistence(&entry.file, "artifact path must be a bare file name"));
    }
    let bytes = fs::read(dir.join(&entry.file)).map_err(|e| EnsembleError::persistence(&entry.file, e))?;

    let actual = hash_bytes_hex(&bytes);
    if actual != entry.blake3 {
        return Err(EnsembleError::persistence(
            &entry.file,
            format!("hash mismatch: expected {}, found {}", entry.blake3, actual),
        ));
    }

    let model = FittedModel::decode(family, &bytes).map_err(|e| EnsembleError::persistence(&entry.file, e))?;
    if model.columns() != columns {
        return Err(EnsembleError::persistence(
            &entry.file,
            "column order differs from the saved feature contract",
        ));
    }
    Ok(model)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = PathBuf::from(path);
    let name = path
        .file_name()
        .map(|n| format!("{}.tmp", n.to_string_lossy()))
        .unwrap_or_else(|| "artifact.tmp".to_string());
    tmp.set_file_name(name);
    fs::write(&tmp, bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;
    use crate::models::tree::{Node, Tree};
    use crate::models::BoostedTrees;

    fn features() -> FeatureSet {
        FeatureSet::new(vec!["x".into()], vec![], vec![]).unwrap()
    }

    fn stump(features: &FeatureSet, right: f64) -> BoostedTrees {
        BoostedTrees::new(
            features.model_columns(),
            -0.1,
            vec![Tree::new(vec![
                Node::internal(0, 0, 2.5, 1, 2),
                Node::leaf(1, -0.7),
                Node::leaf(2, right),
            ])],
        )
    }

    fn two_family_ensemble() -> Ensemble {
        let fs = features();
        let models = BTreeMap::from([
            (ModelFamily::BoostedTreeA, FittedModel::BoostedTreeA(stump(&fs, 0.9))),
            (ModelFamily::BoostedTreeB, FittedModel::BoostedTreeB(stump(&fs, 0.3))),
        ]);
        let stats: TrainingStats = [(ModelFamily::BoostedTreeA, 0.8), (ModelFamily::BoostedTreeB, 0.6)]
            .into_iter()
            .collect();
        let weights = optimize(&stats);
        Ensemble::from_parts(fs, models, weights, stats, Utc::now())
    }

    fn frame() -> Frame {
        Frame::from_columns(vec![("x", vec![1.0, 2.0, 3.0, 0.1 + 0.2])]).unwrap()
    }

    #[test]
    fn test_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let ensemble = two_family_ensemble();
        save(&ensemble, dir.path()).unwrap();
        let loaded = load(dir.path()).unwrap();

        let before = ensemble.predict(&frame()).unwrap();
        let after = loaded.predict(&frame()).unwrap();
        let bits = |v: &[f64]| v.iter().map(|p| p.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&before), bits(&after));
        assert_eq!(loaded.weights(), ensemble.weights());
        assert_eq!(loaded.created_at(), ensemble.created_at());
    }

    #[test]
    fn test_metadata_lists_hashed_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        save(&two_family_ensemble(), dir.path()).unwrap();
        let metadata = read_metadata(dir.path()).unwrap();
        assert_eq!(metadata.artifacts.len(), 2);
        let entry = &metadata.artifacts[&ModelFamily::BoostedTreeA];
        assert_eq!(entry.file, "boosted_tree_a.json");
        let bytes = fs::read(dir.path().join(&entry.file)).unwrap();
        assert_eq!(entry.blake3, hash_bytes_hex(&bytes));
        assert!(!dir.path().join("boosted_tree_a.json.tmp").exists());
    }

    #[test]
    fn test_missing_artifact_drops_family() {
        let dir = tempfile::tempdir().unwrap();
        save(&two_family_ensemble(), dir.path()).unwrap();
        fs::remove_file(dir.path().join("boosted_tree_b.json")).unwrap();

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.families().collect::<Vec<_>>(), vec![ModelFamily::BoostedTreeA]);
        assert_eq!(loaded.weights().get(ModelFamily::BoostedTreeA), 1.0);
        assert!(!loaded.training_stats().contains(ModelFamily::BoostedTreeB));
        assert!(loaded.predict(&frame()).unwrap().iter().all(|p| *p > 0.0 && *p < 1.0));
    }

    #[test]
    fn test_tampered_artifact_drops_family() {
        let dir = tempfile::tempdir().unwrap();
        save(&two_family_ensemble(), dir.path()).unwrap();
        let path = dir.path().join("boosted_tree_a.json");
        let tampered = fs::read_to_string(&path).unwrap().replace("0.9", "0.8");
        fs::write(&path, tampered).unwrap();

        let loaded = load(dir.path()).unwrap();
        assert_eq!(loaded.families().collect::<Vec<_>>(), vec![ModelFamily::BoostedTreeB]);
        assert!(loaded.weights().is_normalized());
    }

    #[test]
    fn test_all_artifacts_missing_is_not_fitted() {
        let dir = tempfile::tempdir().unwrap();
        save(&two_family_ensemble(), dir.path()).unwrap();
        fs::remove_file(dir.path().join("boosted_tree_a.json")).unwrap();
        fs::remove_file(dir.path().join("boosted_tree_b.json")).unwrap();
        assert!(matches!(load(dir.path()), Err(EnsembleError::NotFitted)));
    }

    #[test]
    fn test_missing_metadata_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(load(dir.path()), Err(EnsembleError::Persistence { .. })));

        fs::write(dir.path().join(METADATA_FILE), "{ not json").unwrap();
        assert!(matches!(load(dir.path()), Err(EnsembleError::Persistence { .. })));
    }

    fn edit_metadata(dir: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
        let path = dir.join(METADATA_FILE);
        let mut value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        edit(&mut value);
        fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }

    #[test]
    fn test_inflated_weight_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        save(&two_family_ensemble(), dir.path()).unwrap();
        edit_metadata(dir.path(), |m| m["weights"]["boosted_tree_a"] = serde_json::json!(5.0));

        match load(dir.path()) {
            Err(EnsembleError::Persistence { artifact, .. }) => assert_eq!(artifact, METADATA_FILE),
            other => panic!("expected persistence error, got {other:?}"),
        }
    }

    #[test]
    fn test_weights_must_follow_recorded_auc() {
        let dir = tempfile::tempdir().unwrap();
        save(&two_family_ensemble(), dir.path()).unwrap();
        // still sums to 1, but no longer matches AUC 0.8 / 0.6
        edit_metadata(dir.path(), |m| {
            m["weights"]["boosted_tree_a"] = serde_json::json!(0.5);
            m["weights"]["boosted_tree_b"] = serde_json::json!(0.5);
        });
        assert!(matches!(load(dir.path()), Err(EnsembleError::Persistence { .. })));
    }

    #[test]
    fn test_stats_missing_a_family_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        save(&two_family_ensemble(), dir.path()).unwrap();
        edit_metadata(dir.path(), |m| {
            if let Some(stats) = m["training_stats"].as_object_mut() {
                stats.remove("boosted_tree_b");
            }
        });
        assert!(matches!(load(dir.path()), Err(EnsembleError::Persistence { .. })));
    }

    #[test]
    fn test_dropped_family_ignores_stored_weights() {
        let dir = tempfile::tempdir().unwrap();
        save(&two_family_ensemble(), dir.path()).unwrap();
        edit_metadata(dir.path(), |m| m["weights"]["boosted_tree_a"] = serde_json::json!(5.0));
        fs::remove_file(dir.path().join("boosted_tree_b.json")).unwrap();

        let loaded = load(dir.path()).unwrap();
        assert!(loaded.weights().is_normalized());
        assert!(loaded.predict(&frame()).unwrap().iter().all(|p| *p > 0.0 && *p < 1.0));
    }

    #[test]
    fn test_failed_rename_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("occupied");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("keep"), b"x").unwrap();

        assert!(write_atomic(&target, b"payload").is_err());
        assert!(!dir.path().join("occupied.tmp").exists());
        assert!(target.is_dir());
    }

    #[test]
    fn test_save_unfitted_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = save(&Ensemble::new(features()), dir.path());
        assert!(matches!(result, Err(EnsembleError::NotFitted)));
    }

    #[test]
    fn test_save_onto_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, b"x").unwrap();
        let result = save(&two_family_ensemble(), &file);
        assert!(matches!(result, Err(EnsembleError::Configuration(_))));
    }

    #[test]
    fn test_contract_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        save(&two_family_ensemble(), dir.path()).unwrap();
        let other = FeatureSet::new(vec!["y".into()], vec![], vec![]).unwrap();
        assert!(matches!(
            load_with_contract(dir.path(), &other),
            Err(EnsembleError::Configuration(_))
        ));
        assert!(load_with_contract(dir.path(), &features()).is_ok());
    }
}
