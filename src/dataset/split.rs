//! Seeded train / validation / test splitting
//!
//! Each class is shuffled with a `ChaCha8Rng` seeded from the config and cut
//! into contiguous runs, so every class keeps its share of every split and the
//! same seed always produces the same partitions.

use std::collections::BTreeMap;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::dataset::loader::ImageSample;
use crate::utils::error::{PlantDiseaseError, Result};

/// Configuration for dataset splitting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitConfig {
    pub validation_fraction: f64,
    pub test_fraction: f64,
    pub seed: u64,
    /// Split each class separately
    pub stratified: bool,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            validation_fraction: 0.2,
            test_fraction: 0.0,
            seed: 123,
            stratified: true,
        }
    }
}

impl SplitConfig {
    pub fn new(validation_fraction: f64, test_fraction: f64, seed: u64) -> Result<Self> {
        let config = Self {
            validation_fraction,
            test_fraction,
            seed,
            stratified: true,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("validation", self.validation_fraction), ("test", self.test_fraction)] {
            if !(0.0..1.0).contains(&value) {
                return Err(PlantDiseaseError::Config(format!(
                    "{name} fraction must be in [0, 1), got {value}"
                )));
            }
        }
        if self.validation_fraction + self.test_fraction >= 1.0 {
            return Err(PlantDiseaseError::Config(
                "validation + test fractions must be less than 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Disjoint partitions of one image folder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetSplits {
    pub train: Vec<ImageSample>,
    pub validation: Vec<ImageSample>,
    pub test: Vec<ImageSample>,
    pub num_classes: usize,
}

/// Sizes of the held-out runs for a group of `n` samples.
///
/// Fractions round up so small classes still reach validation, but at least
/// one sample always stays in training.
fn held_out_counts(n: usize, config: &SplitConfig) -> (usize, usize) {
    if n < 2 {
        return (0, 0);
    }
    let n_val = (n as f64 * config.validation_fraction).ceil() as usize;
    let n_test = (n as f64 * config.test_fraction).ceil() as usize;

    let budget = n - 1;
    let n_val = n_val.min(budget);
    let n_test = n_test.min(budget - n_val);
    (n_val, n_test)
}

impl DatasetSplits {
    /// Split `samples` according to `config`
    pub fn from_samples(
        samples: Vec<ImageSample>,
        num_classes: usize,
        config: &SplitConfig,
    ) -> Result<Self> {
        config.validate()?;
        if samples.is_empty() {
            return Err(PlantDiseaseError::Dataset(
                "No images provided for splitting".to_string(),
            ));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let mut splits = Self {
            train: Vec::new(),
            validation: Vec::new(),
            test: Vec::new(),
            num_classes,
        };

        if config.stratified {
            // BTreeMap keeps class visiting order fixed
            let mut by_class: BTreeMap<usize, Vec<ImageSample>> = BTreeMap::new();
            for sample in samples {
                by_class.entry(sample.label.index()).or_default().push(sample);
            }
            for (_, group) in by_class {
                splits.take_group(group, config, &mut rng);
            }
        } else {
            splits.take_group(samples, config, &mut rng);
        }

        Ok(splits)
    }

    fn take_group(&mut self, mut group: Vec<ImageSample>, config: &SplitConfig, rng: &mut ChaCha8Rng) {
        group.shuffle(rng);
        let (n_val, n_test) = held_out_counts(group.len(), config);

        let mut rest = group.split_off(n_val);
        let validation = group;
        let train = rest.split_off(n_test);
        let test = rest;

        self.validation.extend(validation);
        self.test.extend(test);
        self.train.extend(train);
    }

    pub fn has_test(&self) -> bool {
        !self.test.is_empty()
    }

    pub fn stats(&self) -> SplitStats {
        SplitStats {
            total_images: self.train.len() + self.validation.len() + self.test.len(),
            train_size: self.train.len(),
            validation_size: self.validation.len(),
            test_size: self.test.len(),
            num_classes: self.num_classes,
        }
    }
}

/// Statistics about dataset splits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitStats {
    pub total_images: usize,
    pub train_size: usize,
    pub validation_size: usize,
    pub test_size: usize,
    pub num_classes: usize,
}

impl std::fmt::Display for SplitStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pct = |n: usize| {
            if self.total_images == 0 {
                0.0
            } else {
                100.0 * n as f64 / self.total_images as f64
            }
        };
        writeln!(f, "Dataset Split Statistics:")?;
        writeln!(f, "  Total images: {}", self.total_images)?;
        writeln!(f, "  Number of classes: {}", self.num_classes)?;
        writeln!(f, "  Train: {} ({:.1}%)", self.train_size, pct(self.train_size))?;
        writeln!(f, "  Validation: {} ({:.1}%)", self.validation_size, pct(self.validation_size))?;
        writeln!(f, "  Test: {} ({:.1}%)", self.test_size, pct(self.test_size))
    }
}
