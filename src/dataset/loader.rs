//! Image folder loader
//!
//! Reads a directory laid out as one subdirectory per class:
//!
//! ```text
//! data/PlantVillage/
//! ├── Apple___Apple_scab/
//! │   ├── image1.jpg
//! │   └── image2.JPG
//! ├── Apple___Black_rot/
//! │   └── ...
//! └── ...
//! ```
//!
//! Class directories are sorted by name before indices are assigned, so the
//! catalog is identical on every platform and every run.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::artifacts::catalog::ClassCatalog;
use crate::dataset::Label;
use crate::utils::error::{PlantDiseaseError, Result};
use crate::utils::is_supported_image;

/// A single image path with its label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSample {
    pub path: PathBuf,
    pub label: Label,
}

/// An enumerated image folder
#[derive(Debug, Clone)]
pub struct ImageFolder {
    pub root_dir: PathBuf,
    pub catalog: ClassCatalog,
    /// Samples grouped by class, each group in file name order
    pub samples: Vec<ImageSample>,
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Fail before any decoding if `root` is unusable; return the sorted class directory names
fn class_directories(root: &Path) -> Result<Vec<String>> {
    if !root.exists() {
        return Err(PlantDiseaseError::NotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
        return Err(PlantDiseaseError::InvalidInput(format!(
            "dataset path is not a directory: {}",
            root.display()
        )));
    }

    let mut class_dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match entry.file_name().to_str() {
            Some(name) if !is_hidden(name) => class_dirs.push(name.to_string()),
            Some(_) => {}
            None => warn!("Skipping non UTF-8 directory name: {:?}", entry.path()),
        }
    }
    class_dirs.sort();

    if class_dirs.is_empty() {
        return Err(PlantDiseaseError::Dataset(format!(
            "no class subdirectories in {}",
            root.display()
        )));
    }

    Ok(class_dirs)
}

/// Image files directly inside `class_dir`, sorted by path
fn class_images(class_dir: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(class_dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| !e.file_name().to_str().map(is_hidden).unwrap_or(true))
        .map(|e| e.into_path())
        .filter(|p| is_supported_image(p))
        .collect();
    paths.sort();
    paths
}

impl ImageFolder {
    /// Enumerate `root_dir`, building the catalog from its sorted subdirectories
    pub fn open<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        info!("Loading dataset from: {}", root_dir.display());

        let class_dirs = class_directories(&root_dir)?;
        info!("Found {} classes", class_dirs.len());

        let catalog = ClassCatalog::new(class_dirs);
        let samples = Self::collect_samples(&root_dir, &catalog, false)?;

        if samples.is_empty() {
            return Err(PlantDiseaseError::Dataset(format!(
                "no jpg/jpeg/png images found under {}",
                root_dir.display()
            )));
        }

        info!("Loaded {} total samples", samples.len());
        Ok(Self {
            root_dir,
            catalog,
            samples,
        })
    }

    /// Enumerate a second folder (e.g. a held-out test directory) against an
    /// existing catalog. Directories whose name is not in the catalog are an error.
    pub fn open_with_catalog<P: AsRef<Path>>(root_dir: P, catalog: &ClassCatalog) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();
        info!("Loading labelled folder {} against {} known classes", root_dir.display(), catalog.len());

        let samples = Self::collect_samples(&root_dir, catalog, true)?;
        Ok(Self {
            root_dir,
            catalog: catalog.clone(),
            samples,
        })
    }

    fn collect_samples(root: &Path, catalog: &ClassCatalog, strict: bool) -> Result<Vec<ImageSample>> {
        let class_dirs = class_directories(root)?;
        let mut samples = Vec::new();

        for class_name in &class_dirs {
            let index = match catalog.index_of(class_name) {
                Some(index) => index,
                None if strict => {
                    return Err(PlantDiseaseError::Dataset(format!(
                        "class directory '{}' in {} is not in the training catalog",
                        class_name,
                        root.display()
                    )))
                }
                None => continue,
            };
            let label = Label::new(index, catalog.len())?;

            let images = class_images(&root.join(class_name));
            if images.is_empty() {
                warn!("Class '{}' has no images", class_name);
            }
            debug!("Class '{}' (label {}): {} images", class_name, index, images.len());

            samples.extend(images.into_iter().map(|path| ImageSample { path, label }));
        }

        Ok(samples)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.catalog.len()
    }

    pub fn stats(&self) -> DatasetStats {
        let mut class_counts = vec![0usize; self.num_classes()];
        for sample in &self.samples {
            class_counts[sample.label.index()] += 1;
        }

        DatasetStats {
            total_samples: self.samples.len(),
            num_classes: self.num_classes(),
            class_counts,
            class_names: self.catalog.names().to_vec(),
        }
    }
}

/// Statistics about the dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_samples: usize,
    pub num_classes: usize,
    pub class_counts: Vec<usize>,
    pub class_names: Vec<String>,
}

impl DatasetStats {
    /// Print statistics to console
    pub fn print(&self) {
        println!("\nDataset Statistics:");
        println!("  Total samples: {}", self.total_samples);
        println!("  Number of classes: {}", self.num_classes);
        println!("\n  Samples per class:");

        for (idx, (name, count)) in self.class_names.iter().zip(&self.class_counts).enumerate() {
            let bar_len = if self.total_samples > 0 {
                (*count as f32 / self.total_samples as f32 * 40.0) as usize
            } else {
                0
            };
            println!("    {:3}. {:40} {:5} {}", idx, name, count, "█".repeat(bar_len));
        }
    }
}
