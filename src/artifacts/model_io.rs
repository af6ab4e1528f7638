//! Model weight files and the layout of a model directory
//!
//! Weights are Burn named-msgpack records at full precision (`*.mpk`).

use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use tracing::{info, warn};

use crate::artifacts::metadata::ModelMetadata;
use crate::model::PlantClassifier;
use crate::utils::error::{PlantDiseaseError, Result};

pub const BEST_MODEL: &str = "best_model";
pub const LAST_MODEL: &str = "last_model";
pub const FINAL_MODEL: &str = "plant_disease_model";
pub const CLASS_NAMES_FILE: &str = "class_names.json";
/// Catalog name used by older exports
pub const LEGACY_CLASS_NAMES_FILE: &str = "disease-classes.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const HISTORY_STEM: &str = "training_history";

const MODEL_EXTENSION: &str = "mpk";

fn recorder() -> NamedMpkFileRecorder<FullPrecisionSettings> {
    NamedMpkFileRecorder::<FullPrecisionSettings>::new()
}

/// Conventional file names inside a model directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub dir: PathBuf,
}

impl ArtifactPaths {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Full path of a weight file, extension included
    pub fn model_file(&self, name: &str) -> PathBuf {
        self.dir.join(name).with_extension(MODEL_EXTENSION)
    }

    pub fn best_model(&self) -> PathBuf {
        self.model_file(BEST_MODEL)
    }

    pub fn last_model(&self) -> PathBuf {
        self.model_file(LAST_MODEL)
    }

    pub fn final_model(&self) -> PathBuf {
        self.model_file(FINAL_MODEL)
    }

    pub fn class_names(&self) -> PathBuf {
        self.dir.join(CLASS_NAMES_FILE)
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    pub fn history_csv(&self) -> PathBuf {
        self.dir.join(format!("{HISTORY_STEM}.csv"))
    }

    /// The weights to serve: the final model, else the best checkpoint, else the last one
    pub fn resolve_model(&self) -> Result<PathBuf> {
        let candidates = [self.final_model(), self.best_model(), self.last_model()];
        for (i, path) in candidates.iter().enumerate() {
            if path.exists() {
                if i > 0 {
                    warn!(
                        "{} not found, falling back to {}",
                        candidates[0].display(),
                        path.display()
                    );
                }
                info!("Using model weights: {}", path.display());
                return Ok(path.clone());
            }
        }
        Err(PlantDiseaseError::ArtifactNotFound(candidates[0].clone()))
    }

    /// The class catalog, accepting the legacy file name
    pub fn resolve_class_names(&self) -> Result<PathBuf> {
        let current = self.class_names();
        if current.exists() {
            return Ok(current);
        }
        let legacy = self.dir.join(LEGACY_CLASS_NAMES_FILE);
        if legacy.exists() {
            warn!("Using legacy class catalog {}", legacy.display());
            return Ok(legacy);
        }
        Err(PlantDiseaseError::ArtifactNotFound(current))
    }
}

/// Write `model` to `<dir>/<name>.mpk`, creating `dir`. Returns the written path.
pub fn save_model<B: Backend>(model: &PlantClassifier<B>, dir: &Path, name: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let paths = ArtifactPaths::new(dir);
    let path = paths.model_file(name);

    model
        .clone()
        .save_file(path.clone(), &recorder())
        .map_err(|e| PlantDiseaseError::Model(format!("failed to save {}: {e}", path.display())))?;

    info!("Saved model to {}", path.display());
    Ok(path)
}

/// Rebuild the network described by `metadata` and load the weights at `path`
pub fn load_model<B: Backend>(
    metadata: &ModelMetadata,
    path: &Path,
    device: &B::Device,
) -> Result<PlantClassifier<B>> {
    let path = path.with_extension(MODEL_EXTENSION);
    if !path.exists() {
        return Err(PlantDiseaseError::ArtifactNotFound(path));
    }

    let model = PlantClassifier::<B>::init_untrained(
        &metadata.architecture,
        metadata.num_classes,
        metadata.image_size,
        device,
    )?;

    model
        .load_file(path.clone(), &recorder(), device)
        .map_err(|e| PlantDiseaseError::Model(format!("failed to load {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::catalog::ClassCatalog;
    use crate::model::config::{CnnConfig, ModelConfig, TransferConfig};
    use burn::tensor::{Distribution, Tensor};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn metadata(config: ModelConfig) -> ModelMetadata {
        let catalog = ClassCatalog::new(vec!["a".into(), "b".into(), "c".into()]);
        ModelMetadata::new(&config, &catalog, [32, 32])
    }

    fn assert_same_outputs(config: ModelConfig) {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let metadata = metadata(config);
        let model = PlantClassifier::<TestBackend>::init_untrained(
            &metadata.architecture,
            3,
            [32, 32],
            &device,
        )
        .unwrap();

        let path = save_model(&model, &dir.path().join("nested"), FINAL_MODEL).unwrap();
        assert!(path.ends_with("plant_disease_model.mpk"));
        assert!(path.exists());

        let loaded = load_model::<TestBackend>(&metadata, &path, &device).unwrap();

        let x = Tensor::<TestBackend, 4>::random([2, 3, 32, 32], Distribution::Uniform(0.0, 1.0), &device);
        let a: Vec<f32> = model.forward_softmax(x.clone()).into_data().to_vec().unwrap();
        let b: Vec<f32> = loaded.forward_softmax(x).into_data().to_vec().unwrap();
        for (p, q) in a.iter().zip(&b) {
            assert!((p - q).abs() < 1e-5);
        }
    }

    #[test]
    fn test_cnn_roundtrip() {
        assert_same_outputs(ModelConfig::cnn(CnnConfig::tiny()));
    }

    #[test]
    fn test_transfer_roundtrip() {
        assert_same_outputs(ModelConfig::transfer(TransferConfig::tiny()));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let result = load_model::<TestBackend>(
            &metadata(ModelConfig::cnn(CnnConfig::tiny())),
            &dir.path().join("best_model"),
            &device,
        );
        assert!(matches!(result, Err(PlantDiseaseError::ArtifactNotFound(_))));
    }

    #[test]
    fn test_model_fallback_order() {
        let dir = TempDir::new().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        assert!(matches!(paths.resolve_model(), Err(PlantDiseaseError::ArtifactNotFound(_))));

        std::fs::write(paths.last_model(), b"x").unwrap();
        assert_eq!(paths.resolve_model().unwrap(), paths.last_model());

        std::fs::write(paths.best_model(), b"x").unwrap();
        assert_eq!(paths.resolve_model().unwrap(), paths.best_model());

        std::fs::write(paths.final_model(), b"x").unwrap();
        assert_eq!(paths.resolve_model().unwrap(), paths.final_model());
    }

    #[test]
    fn test_legacy_catalog_name() {
        let dir = TempDir::new().unwrap();
        let paths = ArtifactPaths::new(dir.path());
        assert!(paths.resolve_class_names().is_err());

        std::fs::write(dir.path().join(LEGACY_CLASS_NAMES_FILE), "[]").unwrap();
        assert!(paths.resolve_class_names().unwrap().ends_with(LEGACY_CLASS_NAMES_FILE));

        std::fs::write(paths.class_names(), "[]").unwrap();
        assert_eq!(paths.resolve_class_names().unwrap(), paths.class_names());
    }
}
