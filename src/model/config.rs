//! Model Configuration Module
//!
//! Architecture settings for both networks. A `ModelConfig` is stored verbatim
//! in the artifact metadata so a saved model can be rebuilt without the
//! training configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::dataset::preprocess::Preprocessing;
use crate::utils::error::{PlantDiseaseError, Result};

/// Which network to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Convolutional network trained from scratch
    #[default]
    Cnn,
    /// Pretrained backbone with a new classification head
    Transfer,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cnn => write!(f, "cnn"),
            Self::Transfer => write!(f, "transfer"),
        }
    }
}

impl FromStr for ModelType {
    type Err = PlantDiseaseError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cnn" => Ok(Self::Cnn),
            "transfer" | "resnet" | "resnet18" => Ok(Self::Transfer),
            other => Err(PlantDiseaseError::Config(format!(
                "unknown model type '{other}' (expected 'cnn' or 'transfer')"
            ))),
        }
    }
}

/// From-scratch CNN shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CnnConfig {
    /// Filters of each convolution, grouped by block. Every block ends in a 2x2 max-pool.
    pub block_filters: Vec<Vec<usize>>,
    /// Dropout after each block
    pub block_dropout: Vec<f64>,
    /// Hidden dense layers of the classifier
    pub dense_units: Vec<usize>,
    pub dense_dropout: f64,
    /// L2 penalty on the hidden dense kernels
    pub l2: f64,
}

impl Default for CnnConfig {
    fn default() -> Self {
        Self {
            block_filters: vec![vec![32, 32], vec![64, 64], vec![128, 128], vec![256]],
            block_dropout: vec![0.25, 0.25, 0.3, 0.3],
            dense_units: vec![512, 256],
            dense_dropout: 0.5,
            l2: 0.001,
        }
    }
}

impl CnnConfig {
    /// A few-thousand-parameter network for tests and smoke runs
    pub fn tiny() -> Self {
        Self {
            block_filters: vec![vec![4], vec![8]],
            block_dropout: vec![0.0, 0.0],
            dense_units: vec![16],
            dense_dropout: 0.0,
            l2: 0.001,
        }
    }

    /// Spatial size after all blocks
    pub fn output_size(&self, image_size: [usize; 2]) -> [usize; 2] {
        let mut size = image_size;
        for _ in &self.block_filters {
            size = [size[0] / 2, size[1] / 2];
        }
        size
    }

    /// Input width of the first dense layer
    pub fn flatten_dim(&self, image_size: [usize; 2]) -> usize {
        let [h, w] = self.output_size(image_size);
        let channels = self
            .block_filters
            .last()
            .and_then(|block| block.last())
            .copied()
            .unwrap_or(3);
        h * w * channels
    }

    pub fn validate(&self, image_size: [usize; 2]) -> Result<()> {
        if self.block_filters.is_empty() || self.block_filters.iter().any(|b| b.is_empty()) {
            return Err(PlantDiseaseError::Config(
                "cnn.block_filters needs at least one non-empty block".to_string(),
            ));
        }
        if self.block_filters.iter().flatten().any(|&f| f == 0) {
            return Err(PlantDiseaseError::Config("cnn filter counts must be positive".to_string()));
        }
        if self.block_dropout.len() != self.block_filters.len() {
            return Err(PlantDiseaseError::Config(format!(
                "cnn.block_dropout has {} entries but there are {} blocks",
                self.block_dropout.len(),
                self.block_filters.len()
            )));
        }
        for &rate in self.block_dropout.iter().chain(std::iter::once(&self.dense_dropout)) {
            if !(0.0..1.0).contains(&rate) {
                return Err(PlantDiseaseError::Config(format!(
                    "dropout rate must be in [0, 1), got {rate}"
                )));
            }
        }
        if self.l2 < 0.0 {
            return Err(PlantDiseaseError::Config("cnn.l2 must not be negative".to_string()));
        }
        let [h, w] = self.output_size(image_size);
        if h == 0 || w == 0 {
            return Err(PlantDiseaseError::Config(format!(
                "image size {}x{} is too small for {} pooling blocks",
                image_size[0],
                image_size[1],
                self.block_filters.len()
            )));
        }
        Ok(())
    }
}

/// Transfer network shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Burn record holding pretrained backbone weights
    pub backbone_weights: Option<PathBuf>,
    /// Channel width of each of the four residual stages
    pub stage_widths: [usize; 4],
    pub head_units: usize,
    /// Dropout before the hidden head layer
    pub head_dropout: f64,
    /// Dropout before the output layer
    pub output_dropout: f64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            backbone_weights: None,
            stage_widths: [64, 128, 256, 512],
            head_units: 128,
            head_dropout: 0.3,
            output_dropout: 0.2,
        }
    }
}

impl TransferConfig {
    pub fn tiny() -> Self {
        Self {
            backbone_weights: None,
            stage_widths: [4, 4, 8, 8],
            head_units: 8,
            head_dropout: 0.0,
            output_dropout: 0.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.stage_widths.iter().any(|&w| w == 0) || self.head_units == 0 {
            return Err(PlantDiseaseError::Config(
                "transfer widths must be positive".to_string(),
            ));
        }
        for rate in [self.head_dropout, self.output_dropout] {
            if !(0.0..1.0).contains(&rate) {
                return Err(PlantDiseaseError::Config(format!(
                    "dropout rate must be in [0, 1), got {rate}"
                )));
            }
        }
        if let Some(path) = &self.backbone_weights {
            if path.as_os_str().is_empty() {
                return Err(PlantDiseaseError::Config(
                    "transfer.backbone_weights is set but empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Network selection plus the shape of each network
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: ModelType,
    pub cnn: CnnConfig,
    pub transfer: TransferConfig,
}

impl ModelConfig {
    pub fn cnn(cnn: CnnConfig) -> Self {
        Self {
            model_type: ModelType::Cnn,
            cnn,
            ..Default::default()
        }
    }

    pub fn transfer(transfer: TransferConfig) -> Self {
        Self {
            model_type: ModelType::Transfer,
            transfer,
            ..Default::default()
        }
    }

    /// Pixel normalization the selected network expects
    pub fn preprocessing(&self) -> Preprocessing {
        match self.model_type {
            ModelType::Cnn => Preprocessing::rescale(),
            ModelType::Transfer => Preprocessing::imagenet(),
        }
    }

    /// Validate the selected network against the input size
    pub fn validate(&self, image_size: [usize; 2]) -> Result<()> {
        match self.model_type {
            ModelType::Cnn => self.cnn.validate(image_size),
            ModelType::Transfer => {
                self.transfer.validate()?;
                if image_size[0] < 32 || image_size[1] < 32 {
                    return Err(PlantDiseaseError::Config(format!(
                        "transfer network needs at least 32x32 input, got {}x{}",
                        image_size[0], image_size[1]
                    )));
                }
                Ok(())
            }
        }
    }
}
