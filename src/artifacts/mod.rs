//! Persistence for trained models
//!
//! A model directory holds:
//! - `best_model.mpk`, `last_model.mpk`, `plant_disease_model.mpk`: Burn records
//! - `class_names.json`: the class catalog
//! - `metadata.json`: architecture, input size and preprocessing
//! - `training_history.csv` and charts, when enabled

pub mod catalog;
pub mod metadata;
pub mod model_io;

pub use catalog::{load_class_catalog, save_class_catalog, ClassCatalog};
pub use metadata::{ModelMetadata, METADATA_VERSION};
pub use model_io::{load_model, save_model, ArtifactPaths};
