//! # Plant Disease Classifier
//!
//! Trains an image classifier on a folder of leaf photos (one subfolder per
//! disease class) with the Burn framework, saves the model with its class
//! catalog and metadata, and classifies new images with annotated overlays.
//!
//! ## Modules
//!
//! - `dataset`: folder enumeration, seeded splits, augmentation and batching
//! - `model`: a from-scratch CNN and a ResNet-style transfer network
//! - `training`: the fit loop, its callbacks and the staged pipeline
//! - `artifacts`: model weights, class catalog and metadata on disk
//! - `inference`: prediction, overlays and the `test` command
//! - `utils`: logging, metrics, charts and errors
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plant_disease::backend::{default_device, DefaultBackend, TrainingBackend};
//! use plant_disease::config::PipelineConfig;
//! use plant_disease::inference::Predictor;
//! use plant_disease::training::run_pipeline;
//!
//! let outcome = run_pipeline::<TrainingBackend>(&PipelineConfig::default(), &default_device())?;
//! let predictor = Predictor::<DefaultBackend>::load(&outcome.paths.dir, &default_device())?;
//! let result = predictor.predict_file("leaf.jpg", 5)?;
//! ```

pub mod artifacts;
pub mod backend;
pub mod config;
pub mod dataset;
pub mod inference;
pub mod model;
pub mod training;
pub mod utils;

// Re-export commonly used items for convenience
pub use artifacts::{ArtifactPaths, ClassCatalog, ModelMetadata};
pub use config::PipelineConfig;
pub use dataset::{DatasetSplits, ImageFolder, SplitConfig};
pub use inference::{PredictionResult, Predictor};
pub use model::{ModelConfig, ModelType, PlantClassifier};
pub use training::{run_pipeline, TrainingOutcome};
pub use utils::error::{PlantDiseaseError, Result};

/// Version of the library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
