//! Dataset module for loading and processing leaf images
//!
//! This module handles:
//! - Enumerating class folders and building the class catalog
//! - Seeded stratified train/validation/test splits
//! - Augmentation of the training split
//! - Preprocessing shared with inference
//! - Burn `Dataset` / `Batcher` integration

pub mod augmentation;
pub mod burn_dataset;
pub mod loader;
pub mod preprocess;
pub mod split;

use serde::{Deserialize, Serialize};

pub use augmentation::{AugmentationConfig, Augmenter};
pub use burn_dataset::{AugmentingBatcher, LeafBatch, LeafBatcher, LeafDataset, LeafItem};
pub use loader::{DatasetStats, ImageFolder, ImageSample};
pub use preprocess::{Normalization, Preprocessing};
pub use split::{DatasetSplits, SplitConfig, SplitStats};

use crate::utils::error::{PlantDiseaseError, Result};

/// Sparse class index, checked against the class count when created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(usize);

impl Label {
    pub fn new(index: usize, num_classes: usize) -> Result<Self> {
        if index >= num_classes {
            return Err(PlantDiseaseError::InvalidInput(format!(
                "label {index} out of range for {num_classes} classes"
            )));
        }
        Ok(Self(index))
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
