//! Pipeline configuration.
//!
//! One `PipelineConfig` value is built at startup and handed to every stage.
//! Each section is `#[serde(default)]`, so a TOML file only needs to list the
//! fields it changes.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::dataset::augmentation::AugmentationConfig;
use crate::model::config::{ModelConfig, ModelType};
use crate::utils::error::{PlantDiseaseError, Result};
use crate::utils::logging::LogConfig;

/// Read and parse a TOML file into any deserializable config type
pub fn load_toml_config<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = fs::read_to_string(path).map_err(|e| {
        PlantDiseaseError::Config(format!("Failed to read config {}: {e}", path.display()))
    })?;

    toml::from_str(&content).map_err(|e| {
        PlantDiseaseError::Config(format!("Failed to parse config {}: {e}", path.display()))
    })
}

/// Dataset location, geometry and split settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DataConfig {
    /// Root directory holding one subdirectory per class
    pub data_dir: PathBuf,
    /// Optional separate test directory with the same class layout
    pub test_dir: Option<PathBuf>,
    /// Target size `[height, width]`
    pub image_size: [usize; 2],
    /// Fraction of each class held out for validation
    pub validation_split: f64,
    /// Fraction of each class held out for testing
    pub test_split: f64,
    pub seed: u64,
    pub batch_size: usize,
    /// Split each class separately instead of the whole pool
    pub stratified: bool,
    /// Decode every image once up front and keep it in memory
    pub cache_images: bool,
    pub augmentation: AugmentationConfig,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/PlantVillage"),
            test_dir: None,
            image_size: [224, 224],
            validation_split: 0.2,
            test_split: 0.0,
            seed: 123,
            batch_size: 16,
            stratified: true,
            cache_images: true,
            augmentation: AugmentationConfig::default(),
        }
    }
}

/// Initial training phase settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub learning_rate: f64,
    /// Adam weight decay; zero disables it
    pub weight_decay: f32,
    /// Epochs without val_loss improvement before stopping
    pub early_stopping_patience: usize,
    /// Multiplier applied to the learning rate on plateau
    pub lr_factor: f64,
    /// Epochs without val_loss improvement before reducing the learning rate
    pub lr_patience: usize,
    /// Lower bound for the learning rate
    pub min_lr: f64,
    /// Minimum val_loss decrease that counts as an improvement
    pub min_delta: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            learning_rate: 1e-3,
            weight_decay: 0.0,
            early_stopping_patience: 10,
            lr_factor: 0.5,
            lr_patience: 5,
            min_lr: 1e-7,
            min_delta: 0.0,
        }
    }
}

/// Optional second phase for transfer models
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FineTuneConfig {
    pub enabled: bool,
    /// Number of trailing backbone units made trainable
    pub unfreeze_units: usize,
    pub epochs: usize,
    pub learning_rate: f64,
}

impl Default for FineTuneConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            unfreeze_units: 3,
            epochs: 10,
            learning_rate: 1e-4,
        }
    }
}

/// Where artifacts are written
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OutputConfig {
    pub model_dir: PathBuf,
    /// Also write the history CSV and SVG charts
    pub save_history: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./models"),
            save_history: true,
        }
    }
}

/// Settings for the `test` command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    /// Directory scanned when no image path is given
    pub sample_dir: PathBuf,
    /// Annotated images are written here
    pub predictions_dir: PathBuf,
    pub top_k: usize,
    /// Upper bound on images taken from `sample_dir`
    pub max_samples: usize,
    /// TrueType font for the overlay title; system fonts are tried when unset
    pub font_path: Option<PathBuf>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            sample_dir: PathBuf::from("./samples"),
            predictions_dir: PathBuf::from("./models/predictions"),
            top_k: 5,
            max_samples: 5,
            font_path: None,
        }
    }
}

/// Complete configuration for a pipeline run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub data: DataConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub fine_tune: FineTuneConfig,
    pub output: OutputConfig,
    pub inference: InferenceConfig,
    pub logging: LogConfig,
}

impl PipelineConfig {
    /// Load from a TOML file and validate
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = load_toml_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty TOML
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// True when the fine-tune phase will actually run
    pub fn fine_tune_active(&self) -> bool {
        self.fine_tune.enabled && self.model.model_type == ModelType::Transfer
    }

    /// Reject settings that would fail later in the run
    pub fn validate(&self) -> Result<()> {
        let data = &self.data;
        let fraction_ok = |f: f64| (0.0..1.0).contains(&f);

        if !fraction_ok(data.validation_split) {
            return Err(PlantDiseaseError::Config(format!(
                "validation_split must be in [0, 1), got {}",
                data.validation_split
            )));
        }
        if !fraction_ok(data.test_split) {
            return Err(PlantDiseaseError::Config(format!(
                "test_split must be in [0, 1), got {}",
                data.test_split
            )));
        }
        if data.validation_split + data.test_split >= 1.0 {
            return Err(PlantDiseaseError::Config(
                "validation_split + test_split must be less than 1.0".to_string(),
            ));
        }
        if data.image_size.iter().any(|&d| d == 0) {
            return Err(PlantDiseaseError::Config("image_size must be non-zero".to_string()));
        }
        if data.batch_size == 0 {
            return Err(PlantDiseaseError::Config("batch_size must be at least 1".to_string()));
        }
        if self.training.epochs == 0 {
            return Err(PlantDiseaseError::Config("epochs must be at least 1".to_string()));
        }
        if self.training.learning_rate <= 0.0 {
            return Err(PlantDiseaseError::Config("learning_rate must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.training.lr_factor) || self.training.lr_factor == 0.0 {
            return Err(PlantDiseaseError::Config("lr_factor must be in (0, 1)".to_string()));
        }
        if self.inference.top_k == 0 {
            return Err(PlantDiseaseError::Config("top_k must be at least 1".to_string()));
        }

        if self.fine_tune.enabled {
            if self.model.model_type != ModelType::Transfer {
                warn!("fine_tune is enabled but the model is not a transfer network; the phase will be skipped");
            }
            if self.fine_tune.learning_rate <= 0.0 {
                return Err(PlantDiseaseError::Config(
                    "fine_tune.learning_rate must be positive".to_string(),
                ));
            }
            if self.fine_tune.learning_rate >= self.training.learning_rate {
                warn!(
                    "fine_tune.learning_rate ({}) is not lower than the initial rate ({})",
                    self.fine_tune.learning_rate, self.training.learning_rate
                );
            }
        }

        self.model.validate(data.image_size)
    }
}
