//! Error Handling Module
//!
//! Defines the error type shared by every stage of the plant disease pipeline.
//! Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for plant disease pipeline operations
#[derive(Error, Debug)]
pub enum PlantDiseaseError {
    /// Error loading or decoding an image
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error with dataset layout or contents
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Error building or running a model
    #[error("Model error: {0}")]
    Model(String),

    /// Error during the fit loop
    #[error("Training error: {0}")]
    Training(String),

    /// Error with inference
    #[error("Inference error: {0}")]
    Inference(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Path not found
    #[error("Path not found: {0}")]
    NotFound(PathBuf),

    /// A persisted model, catalog or metadata file is missing
    #[error("Artifact not found: {0}")]
    ArtifactNotFound(PathBuf),

    /// Metadata written by a newer schema
    #[error("Unsupported metadata version {found} (supported up to {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Convenience Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PlantDiseaseError>;

impl From<serde_json::Error> for PlantDiseaseError {
    fn from(err: serde_json::Error) -> Self {
        PlantDiseaseError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for PlantDiseaseError {
    fn from(err: toml::de::Error) -> Self {
        PlantDiseaseError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for PlantDiseaseError {
    fn from(err: toml::ser::Error) -> Self {
        PlantDiseaseError::Serialization(err.to_string())
    }
}

impl From<image::ImageError> for PlantDiseaseError {
    fn from(err: image::ImageError) -> Self {
        PlantDiseaseError::InvalidInput(format!("image: {}", err))
    }
}
