//! End-to-end training run
//!
//! Stages advance INITIAL_TRAIN -> [FINE_TUNE] -> EVALUATE -> SAVE -> DONE.
//! Fine-tuning only runs for transfer models with it enabled.

use std::fmt;
use std::path::PathBuf;

use burn::{data::dataset::Dataset, module::AutodiffModule, tensor::backend::AutodiffBackend};
use colored::Colorize;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::artifacts::catalog::ClassCatalog;
use crate::artifacts::metadata::ModelMetadata;
use crate::artifacts::model_io::{save_model, ArtifactPaths, FINAL_MODEL, HISTORY_STEM, LAST_MODEL};
use crate::config::PipelineConfig;
use crate::dataset::burn_dataset::{AugmentingBatcher, LeafBatcher, LeafDataset};
use crate::dataset::loader::ImageFolder;
use crate::dataset::split::{DatasetSplits, SplitConfig};
use crate::model::PlantClassifier;
use crate::training::callbacks::BestCheckpoint;
use crate::training::history::{TrainingHistory, TrainingPhase};
use crate::training::trainer::{evaluate, run_phase, FitData, PhaseSettings};
use crate::utils::error::{PlantDiseaseError, Result};
use crate::utils::metrics::EvaluationReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    InitialTrain,
    FineTune,
    Evaluate,
    Save,
    Done,
}

impl PipelineStage {
    pub fn next(self, fine_tune: bool) -> Self {
        match self {
            Self::InitialTrain if fine_tune => Self::FineTune,
            Self::InitialTrain | Self::FineTune => Self::Evaluate,
            Self::Evaluate => Self::Save,
            Self::Save | Self::Done => Self::Done,
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InitialTrain => "INITIAL_TRAIN",
            Self::FineTune => "FINE_TUNE",
            Self::Evaluate => "EVALUATE",
            Self::Save => "SAVE",
            Self::Done => "DONE",
        };
        write!(f, "{name}")
    }
}

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    pub history: TrainingHistory,
    pub best_val_accuracy: Option<f64>,
    pub validation: Option<EvaluationReport>,
    pub test: Option<EvaluationReport>,
    pub metadata: ModelMetadata,
    pub paths: ArtifactPaths,
    pub model_path: PathBuf,
}

struct PreparedData {
    catalog: ClassCatalog,
    train: LeafDataset,
    validation: LeafDataset,
    test: LeafDataset,
}

fn prepare_data(config: &PipelineConfig) -> Result<PreparedData> {
    let data = &config.data;
    let folder = ImageFolder::open(&data.data_dir)?;
    folder.stats().print();

    let split = SplitConfig {
        validation_fraction: data.validation_split,
        test_fraction: data.test_split,
        seed: data.seed,
        stratified: data.stratified,
    };
    let mut splits = DatasetSplits::from_samples(folder.samples, folder.catalog.len(), &split)?;

    if let Some(test_dir) = &data.test_dir {
        let held_out = ImageFolder::open_with_catalog(test_dir, &folder.catalog)?;
        info!("Adding {} images from {}", held_out.len(), test_dir.display());
        splits.test.extend(held_out.samples);
    }

    let stats = splits.stats();
    info!(
        "Split: {} train / {} validation / {} test",
        stats.train_size, stats.validation_size, stats.test_size
    );

    let size = data.image_size;
    let cache = data.cache_images;
    Ok(PreparedData {
        catalog: folder.catalog,
        train: LeafDataset::build(splits.train, size, cache, "train")?,
        validation: LeafDataset::build(splits.validation, size, cache, "validation")?,
        test: LeafDataset::build(splits.test, size, cache, "test")?,
    })
}

fn print_stage(stage: PipelineStage) {
    println!("\n{}", format!("=== {stage} ===").cyan().bold());
}

/// Load data, train, evaluate and write every artifact to `config.output.model_dir`
pub fn run_pipeline<B: AutodiffBackend>(config: &PipelineConfig, device: &B::Device) -> Result<TrainingOutcome> {
    config.validate()?;
    let fine_tune = config.fine_tune_active();
    let image_size = config.data.image_size;
    let batch_size = config.data.batch_size;
    let paths = ArtifactPaths::new(&config.output.model_dir);
    std::fs::create_dir_all(&paths.dir)?;

    let data = prepare_data(config)?;
    if data.catalog.len() < 2 {
        return Err(PlantDiseaseError::Dataset(format!(
            "need at least 2 classes, found {}",
            data.catalog.len()
        )));
    }

    let preprocessing = config.model.preprocessing();
    let train_batcher = AugmentingBatcher::new(
        image_size,
        preprocessing.clone(),
        config.data.augmentation.clone(),
        config.data.seed,
    );
    let eval_batcher = LeafBatcher::new(image_size, preprocessing);
    let fit_data = FitData {
        train: &data.train,
        validation: &data.validation,
        train_batcher: &train_batcher,
        eval_batcher: &eval_batcher,
        batch_size,
    };

    let mut model = PlantClassifier::<B>::init(&config.model, data.catalog.len(), image_size, device)?;
    let metadata = ModelMetadata::new(&config.model, &data.catalog, image_size);

    let mut rng = ChaCha8Rng::seed_from_u64(config.data.seed);
    let mut checkpoint = BestCheckpoint::new();
    let mut history = TrainingHistory::new();
    let mut validation = None;
    let mut test = None;
    let mut model_path = paths.final_model();

    let mut stage = PipelineStage::InitialTrain;
    while stage != PipelineStage::Done {
        print_stage(stage);
        match stage {
            PipelineStage::InitialTrain => {
                let settings = PhaseSettings {
                    phase: TrainingPhase::InitialTrain,
                    epochs: config.training.epochs,
                    learning_rate: config.training.learning_rate,
                    first_epoch: history.next_epoch(),
                };
                let (trained, phase_history) = run_phase(
                    model,
                    &fit_data,
                    &settings,
                    &config.training,
                    &mut checkpoint,
                    &paths,
                    &mut rng,
                    device,
                )?;
                model = trained;
                history.extend(phase_history);
            }
            PipelineStage::FineTune => {
                model = model.unfreeze(config.fine_tune.unfreeze_units);
                info!(
                    "Unfroze the last {} backbone units, learning rate {:.1e}",
                    config.fine_tune.unfreeze_units, config.fine_tune.learning_rate
                );
                let settings = PhaseSettings {
                    phase: TrainingPhase::FineTune,
                    epochs: config.fine_tune.epochs,
                    learning_rate: config.fine_tune.learning_rate,
                    first_epoch: history.next_epoch(),
                };
                let (trained, phase_history) = run_phase(
                    model,
                    &fit_data,
                    &settings,
                    &config.training,
                    &mut checkpoint,
                    &paths,
                    &mut rng,
                    device,
                )?;
                model = trained;
                history.extend(phase_history);
            }
            PipelineStage::Evaluate => {
                let inference_model = model.valid();
                let names = data.catalog.names();
                for (split, dataset, slot) in [
                    ("validation", &data.validation, &mut validation),
                    ("test", &data.test, &mut test),
                ] {
                    if dataset.is_empty() {
                        continue;
                    }
                    let report = evaluate(&inference_model, dataset, &eval_batcher, batch_size, device)?
                        .into_report(split, names);
                    println!("{}", report.display());
                    *slot = Some(report);
                }
            }
            PipelineStage::Save => {
                save_model(&model, &paths.dir, LAST_MODEL)?;
                model_path = save_model(&model, &paths.dir, FINAL_MODEL)?;
                data.catalog.save(&paths.class_names())?;
                metadata.save(&paths.metadata())?;
                info!("Saved class catalog and metadata to {}", paths.dir.display());

                if config.output.save_history {
                    history.save_csv(&paths.history_csv())?;
                    history.save_charts(&paths.dir, HISTORY_STEM)?;
                }
            }
            PipelineStage::Done => {}
        }
        stage = stage.next(fine_tune);
    }

    let best_val_accuracy = checkpoint.best_accuracy;
    if let Some(best) = best_val_accuracy {
        println!(
            "{} best validation accuracy {:.2}% (epoch {})",
            "Training complete:".green().bold(),
            best * 100.0,
            checkpoint.best_epoch.unwrap_or(0)
        );
    }

    Ok(TrainingOutcome {
        history,
        best_val_accuracy,
        validation,
        test,
        metadata,
        paths,
        model_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::catalog::ClassCatalog;
    use crate::dataset::augmentation::AugmentationConfig;
    use crate::model::config::{CnnConfig, ModelConfig, TransferConfig};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use std::path::Path;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn write_dataset(root: &Path, classes: &[&str], per_class: usize) {
        for (c, name) in classes.iter().enumerate() {
            let dir = root.join(name);
            std::fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let shade = (i * 7 % 60) as u8;
                let color = if c == 0 {
                    Rgb([180 + shade, 40, 40])
                } else {
                    Rgb([40, 160 + shade, 40])
                };
                RgbImage::from_pixel(40, 40, color)
                    .save(dir.join(format!("img_{i:02}.png")))
                    .unwrap();
            }
        }
    }

    fn config(data_dir: &Path, model_dir: &Path, model: ModelConfig) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.data.data_dir = data_dir.to_path_buf();
        config.data.image_size = [32, 32];
        config.data.batch_size = 8;
        config.data.cache_images = false;
        config.data.augmentation = AugmentationConfig::default();
        config.model = model;
        config.training.epochs = 1;
        config.output.model_dir = model_dir.to_path_buf();
        config
    }

    #[test]
    fn test_stage_order() {
        use PipelineStage::*;
        assert_eq!(InitialTrain.next(false), Evaluate);
        assert_eq!(InitialTrain.next(true), FineTune);
        assert_eq!(FineTune.next(true), Evaluate);
        assert_eq!(Evaluate.next(true), Save);
        assert_eq!(Save.next(false), Done);
        assert_eq!(Done.next(false), Done);
    }

    #[test]
    fn test_end_to_end_cnn() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let model_dir = dir.path().join("out/models");
        write_dataset(&data_dir, &["healthy", "rust"], 20);

        let config = config(&data_dir, &model_dir, ModelConfig::cnn(CnnConfig::tiny()));
        let outcome = run_pipeline::<TestBackend>(&config, &Default::default()).unwrap();

        assert_eq!(outcome.history.len(), 1);
        assert!(model_dir.join("plant_disease_model.mpk").exists());
        assert!(model_dir.join("last_model.mpk").exists());
        assert!(model_dir.join("best_model.mpk").exists());
        assert!(model_dir.join("training_history.csv").exists());
        assert_eq!(outcome.model_path, model_dir.join("plant_disease_model.mpk"));

        let catalog = ClassCatalog::load(&model_dir.join("class_names.json")).unwrap();
        assert_eq!(catalog.names(), ["healthy".to_string(), "rust".to_string()]);

        let metadata = ModelMetadata::load(&model_dir.join("metadata.json")).unwrap();
        assert_eq!(metadata.num_classes, 2);
        assert_eq!(metadata.image_size, [32, 32]);

        let validation = outcome.validation.unwrap();
        assert_eq!(validation.total_samples, 8);
        assert!(outcome.test.is_none());
    }

    #[test]
    fn test_transfer_with_fine_tune() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("data");
        let model_dir = dir.path().join("models");
        write_dataset(&data_dir, &["a", "b"], 6);

        let mut config = config(&data_dir, &model_dir, ModelConfig::transfer(TransferConfig::tiny()));
        config.data.test_split = 0.2;
        config.data.cache_images = true;
        config.output.save_history = false;
        config.fine_tune.enabled = true;
        config.fine_tune.epochs = 1;

        let outcome = run_pipeline::<TestBackend>(&config, &Default::default()).unwrap();

        assert_eq!(outcome.history.len(), 2);
        assert_eq!(outcome.history.fine_tune_start(), Some(2));
        assert!(outcome.test.is_some());
        assert!(!model_dir.join("training_history.csv").exists());
        assert_eq!(outcome.metadata.model_type, crate::model::ModelType::Transfer);
    }

    #[test]
    fn test_missing_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = config(
            &dir.path().join("nope"),
            &dir.path().join("models"),
            ModelConfig::cnn(CnnConfig::tiny()),
        );
        assert!(run_pipeline::<TestBackend>(&config, &Default::default()).is_err());
    }
}
