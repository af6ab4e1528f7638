//! Class catalog: the ordered list of class names addressed by label index.
//!
//! Written as a JSON list. The reader also accepts the object form
//! `{"0": "Apple___scab", "1": ...}` and normalizes both to the same list.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::utils::error::{PlantDiseaseError, Result};

/// Ordered class names; position is the label index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassCatalog {
    names: Vec<String>,
}

impl ClassCatalog {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Display name for an index, with a placeholder for unknown indices
    pub fn display_name(&self, index: usize) -> String {
        match self.get(index) {
            Some(name) => name.to_string(),
            None => format!("Class_{:02} (Unknown)", index),
        }
    }

    /// Parse either JSON shape
    pub fn from_json_str(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_json_value(value)
    }

    pub fn from_json_value(value: Value) -> Result<Self> {
        match value {
            Value::Array(items) => {
                let names = items
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s),
                        other => Err(PlantDiseaseError::Serialization(format!(
                            "class catalog entries must be strings, found {other}"
                        ))),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Self::new(names))
            }
            Value::Object(map) => {
                let mut indexed = BTreeMap::new();
                let mut unindexed = Vec::new();

                for (key, item) in map {
                    let name = match item {
                        Value::String(s) => s,
                        other => {
                            return Err(PlantDiseaseError::Serialization(format!(
                                "class catalog entry '{key}' must be a string, found {other}"
                            )))
                        }
                    };
                    match key.trim().parse::<usize>() {
                        Ok(index) => {
                            indexed.insert(index, name);
                        }
                        Err(_) => unindexed.push(name),
                    }
                }

                if !unindexed.is_empty() {
                    if !indexed.is_empty() {
                        return Err(PlantDiseaseError::Serialization(
                            "class catalog mixes numeric and non-numeric keys".to_string(),
                        ));
                    }
                    // No indices to go by: keep the map's key order
                    return Ok(Self::new(unindexed));
                }

                let expected: Vec<usize> = (0..indexed.len()).collect();
                let keys: Vec<usize> = indexed.keys().copied().collect();
                if keys != expected {
                    tracing::warn!(
                        "class catalog indices are not contiguous from 0 ({:?}); compacting in numeric order",
                        keys
                    );
                }
                Ok(Self::new(indexed.into_values().collect()))
            }
            other => Err(PlantDiseaseError::Serialization(format!(
                "class catalog must be a list or an object, found {other}"
            ))),
        }
    }

    /// Write as a pretty JSON list, creating the parent directory
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(&self.names)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(PlantDiseaseError::ArtifactNotFound(path.to_path_buf()));
        }
        Self::from_json_str(&fs::read_to_string(path)?)
    }
}

impl From<Vec<String>> for ClassCatalog {
    fn from(names: Vec<String>) -> Self {
        Self::new(names)
    }
}

/// Write a catalog file
pub fn save_class_catalog(catalog: &ClassCatalog, path: &Path) -> Result<()> {
    catalog.save(path)
}

/// Read a catalog file in either supported shape
pub fn load_class_catalog(path: &Path) -> Result<ClassCatalog> {
    ClassCatalog::load(path)
}
