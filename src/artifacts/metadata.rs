//! Versioned model metadata written next to the weights.
//!
//! Holds everything needed to rebuild the network and feed it correctly:
//! architecture, input size, class names and the preprocessing it was trained with.

use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::artifacts::catalog::ClassCatalog;
use crate::dataset::preprocess::Preprocessing;
use crate::model::config::{ModelConfig, ModelType};
use crate::utils::error::{PlantDiseaseError, Result};

/// Current metadata schema version
pub const METADATA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub version: u32,
    pub num_classes: usize,
    /// `[height, width]`
    pub image_size: [usize; 2],
    pub model_type: ModelType,
    pub class_names: Vec<String>,
    pub preprocessing: Preprocessing,
    pub architecture: ModelConfig,
    /// RFC 3339 timestamp
    pub created_at: String,
}

impl ModelMetadata {
    pub fn new(architecture: &ModelConfig, catalog: &ClassCatalog, image_size: [usize; 2]) -> Self {
        Self {
            version: METADATA_VERSION,
            num_classes: catalog.len(),
            image_size,
            model_type: architecture.model_type,
            class_names: catalog.names().to_vec(),
            preprocessing: architecture.preprocessing(),
            architecture: architecture.clone(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    pub fn catalog(&self) -> ClassCatalog {
        ClassCatalog::new(self.class_names.clone())
    }

    pub fn validate(&self) -> Result<()> {
        if self.version == 0 || self.version > METADATA_VERSION {
            return Err(PlantDiseaseError::UnsupportedVersion {
                found: self.version,
                supported: METADATA_VERSION,
            });
        }
        if self.num_classes != self.class_names.len() {
            return Err(PlantDiseaseError::Model(format!(
                "metadata lists {} class names but num_classes is {}",
                self.class_names.len(),
                self.num_classes
            )));
        }
        if self.num_classes == 0 {
            return Err(PlantDiseaseError::Model("metadata has no classes".to_string()));
        }
        if self.image_size.iter().any(|&d| d == 0) {
            return Err(PlantDiseaseError::Model(format!(
                "invalid image size {:?} in metadata",
                self.image_size
            )));
        }
        if self.architecture.model_type != self.model_type {
            return Err(PlantDiseaseError::Model(format!(
                "model_type {} does not match architecture {}",
                self.model_type, self.architecture.model_type
            )));
        }
        self.preprocessing.validate()
    }

    /// Write as pretty JSON, creating the parent directory
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Read and validate
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PlantDiseaseError::ArtifactNotFound(path.to_path_buf()));
        }
        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(path)?)?;

        // Check the version before the schema, so future files fail with a clear message
        let version = raw.get("version").and_then(|v| v.as_u64()).ok_or_else(|| {
            PlantDiseaseError::Serialization(format!(
                "{} has no numeric 'version' field",
                path.display()
            ))
        })?;
        if version == 0 || version > u64::from(METADATA_VERSION) {
            return Err(PlantDiseaseError::UnsupportedVersion {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                supported: METADATA_VERSION,
            });
        }

        let metadata: Self = serde_json::from_value(raw)?;
        metadata.validate()?;
        Ok(metadata)
    }
}
