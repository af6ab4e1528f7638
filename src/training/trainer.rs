//! Fit loop and evaluation
//!
//! A hand-written loop over Burn's optimizer API rather than the high-level
//! `Learner`, so the callbacks can snapshot and restore weights and the
//! learning rate can change between epochs.

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    module::{AutodiffModule, Module},
    nn::loss::CrossEntropyLossConfig,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, backend::Backend, ElementConversion, Int, Tensor},
};
use indicatif::{ProgressBar, ProgressStyle};
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info, warn};

use crate::artifacts::model_io::{save_model, ArtifactPaths, BEST_MODEL};
use crate::config::TrainingConfig;
use crate::dataset::burn_dataset::{AugmentingBatcher, LeafBatch, LeafBatcher, LeafDataset, LeafItem};
use crate::model::PlantClassifier;
use crate::training::callbacks::{BestCheckpoint, EarlyStopping};
use crate::training::history::{EpochMetrics, TrainingHistory, TrainingPhase};
use crate::training::scheduler::ReduceOnPlateauState;
use crate::utils::error::{PlantDiseaseError, Result};
use crate::utils::logging::TrainingLogger;
use crate::utils::metrics::{EvaluationReport, RunningAverage};

/// Datasets and batchers shared by every phase
pub struct FitData<'a> {
    pub train: &'a LeafDataset,
    pub validation: &'a LeafDataset,
    pub train_batcher: &'a AugmentingBatcher,
    pub eval_batcher: &'a LeafBatcher,
    pub batch_size: usize,
}

/// One training phase
#[derive(Debug, Clone)]
pub struct PhaseSettings {
    pub phase: TrainingPhase,
    pub epochs: usize,
    pub learning_rate: f64,
    /// Number given to this phase's first epoch
    pub first_epoch: usize,
}

/// Predictions and loss over a whole split
#[derive(Debug, Clone, Default)]
pub struct EvalOutput {
    pub loss: f64,
    pub accuracy: f64,
    pub predictions: Vec<usize>,
    pub targets: Vec<usize>,
}

impl EvalOutput {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn into_report(self, split: &str, class_names: &[String]) -> EvaluationReport {
        EvaluationReport::from_predictions(split, &self.predictions, &self.targets, class_names, self.loss)
    }
}

fn load_items(dataset: &LeafDataset, indices: &[usize]) -> Result<Vec<LeafItem>> {
    indices.iter().map(|&i| dataset.try_get(i)).collect()
}

fn count_correct<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> usize {
    let [n, _] = logits.dims();
    let correct: i64 = logits
        .argmax(1)
        .reshape([n])
        .equal(targets)
        .int()
        .sum()
        .into_scalar()
        .elem();
    correct.max(0) as usize
}

fn to_indices<B: Backend>(tensor: Tensor<B, 1, Int>) -> Result<Vec<usize>> {
    let values = tensor
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| PlantDiseaseError::Training(format!("failed to read tensor: {e:?}")))?;
    Ok(values.into_iter().map(|v| v.max(0) as usize).collect())
}

/// Run `model` over `dataset` without augmentation. Use the inference backend.
pub fn evaluate<B: Backend>(
    model: &PlantClassifier<B>,
    dataset: &LeafDataset,
    batcher: &LeafBatcher,
    batch_size: usize,
    device: &B::Device,
) -> Result<EvalOutput> {
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let mut loss = RunningAverage::new();
    let mut output = EvalOutput::default();

    let indices: Vec<usize> = (0..dataset.len()).collect();
    for chunk in indices.chunks(batch_size.max(1)) {
        let items = load_items(dataset, chunk)?;
        let batch: LeafBatch<B> = batcher.batch(items, device);
        let n = chunk.len();

        let logits = model.forward(batch.images);
        let batch_loss: f64 = loss_fn
            .forward(logits.clone(), batch.targets.clone())
            .into_scalar()
            .elem();
        loss.add_weighted(batch_loss, n);

        let [rows, _] = logits.dims();
        output.predictions.extend(to_indices(logits.argmax(1).reshape([rows]))?);
        output.targets.extend(to_indices(batch.targets)?);
    }

    let correct = output
        .predictions
        .iter()
        .zip(&output.targets)
        .filter(|(p, t)| p == t)
        .count();
    output.loss = loss.average();
    output.accuracy = if output.is_empty() {
        0.0
    } else {
        correct as f64 / output.len() as f64
    };
    Ok(output)
}

fn progress_bar(batches: usize) -> ProgressBar {
    let pb = ProgressBar::new(batches as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("  {spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} batches | {msg}")
    {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

/// Train one phase. Returns the model with its best-val_loss weights restored.
#[allow(clippy::too_many_arguments)]
pub fn run_phase<B: AutodiffBackend>(
    mut model: PlantClassifier<B>,
    data: &FitData<'_>,
    settings: &PhaseSettings,
    training: &TrainingConfig,
    checkpoint: &mut BestCheckpoint,
    paths: &ArtifactPaths,
    rng: &mut ChaCha8Rng,
    device: &B::Device,
) -> Result<(PlantClassifier<B>, TrainingHistory)> {
    if data.train.is_empty() {
        return Err(PlantDiseaseError::Training("training split is empty".to_string()));
    }

    let weight_decay = (training.weight_decay > 0.0).then(|| WeightDecayConfig::new(training.weight_decay));
    let mut optimizer = AdamConfig::new().with_weight_decay(weight_decay).init();
    let loss_fn = CrossEntropyLossConfig::new().init(device);

    let mut plateau = ReduceOnPlateauState::from_config(settings.learning_rate, training);
    let mut early_stopping = EarlyStopping::on_val_loss(training.early_stopping_patience, training.min_delta);
    // A record, not a clone: clones share BatchNorm running statistics
    let mut best_weights: Option<<PlantClassifier<B> as Module<B>>::Record> = None;
    let mut history = TrainingHistory::new();
    let mut logger = TrainingLogger::new(&settings.phase.to_string(), settings.epochs);
    let mut lr = settings.learning_rate;

    if data.validation.is_empty() {
        warn!("Validation split is empty; callbacks will monitor training loss");
    }

    let mut indices: Vec<usize> = (0..data.train.len()).collect();
    let num_batches = indices.len().div_ceil(data.batch_size.max(1));

    for local_epoch in 0..settings.epochs {
        let epoch = settings.first_epoch + local_epoch;
        logger.start_epoch(local_epoch);

        indices.shuffle(rng);
        let mut train_loss = RunningAverage::new();
        let mut correct = 0usize;
        let pb = progress_bar(num_batches);

        for chunk in indices.chunks(data.batch_size.max(1)) {
            let items = load_items(data.train, chunk)?;
            let batch: LeafBatch<B> = data.train_batcher.batch(items, device);
            let n = chunk.len();

            let logits = model.forward(batch.images);
            let loss = loss_fn.forward(logits.clone(), batch.targets.clone())
                + model.regularization_loss(device);

            let loss_value: f64 = loss.clone().into_scalar().elem();
            if !loss_value.is_finite() {
                pb.finish_and_clear();
                return Err(PlantDiseaseError::Training(format!(
                    "loss became {loss_value} in epoch {epoch}"
                )));
            }
            train_loss.add_weighted(loss_value, n);
            correct += count_correct(logits, batch.targets);

            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optimizer.step(lr, model, grads);

            pb.inc(1);
            pb.set_message(format!("loss {:.4}", train_loss.average()));
        }
        pb.finish_and_clear();

        let train_accuracy = correct as f64 / data.train.len() as f64;

        let (val_loss, val_accuracy) = if data.validation.is_empty() {
            (train_loss.average(), train_accuracy)
        } else {
            let eval = evaluate(&model.valid(), data.validation, data.eval_batcher, data.batch_size, device)?;
            (eval.loss, eval.accuracy)
        };

        logger.end_epoch(train_loss.average(), val_loss, val_accuracy, lr);
        history.push(EpochMetrics {
            epoch,
            phase: settings.phase,
            train_loss: train_loss.average(),
            train_accuracy,
            val_loss,
            val_accuracy,
            learning_rate: lr,
        });

        if checkpoint.update(epoch, val_accuracy) {
            logger.log_new_best(val_accuracy);
            save_model(&model, &paths.dir, BEST_MODEL)?;
        }

        let decision = early_stopping.step(epoch, val_loss);
        if decision.improved {
            debug!("val_loss improved to {:.4}; keeping weights from epoch {}", val_loss, epoch);
            best_weights = Some(model.clone().into_record());
        }

        let new_lr = plateau.step(val_loss);
        if plateau.lr_was_reduced() {
            logger.log_lr_reduced(lr, new_lr);
        }
        lr = new_lr;

        if decision.should_stop {
            logger.log_early_stop(early_stopping.patience());
            break;
        }
    }

    if let (Some(best), Some(best_epoch)) = (best_weights, early_stopping.best_epoch()) {
        info!(
            "Restoring weights from epoch {} (val_loss {:.4})",
            best_epoch,
            early_stopping.best_metric()
        );
        model = model.load_record(best);
    }

    logger.log_complete(history.len(), history.best_val_accuracy().unwrap_or(0.0));
    Ok((model, history))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::augmentation::AugmentationConfig;
    use crate::dataset::loader::ImageSample;
    use crate::dataset::preprocess::Preprocessing;
    use crate::dataset::Label;
    use crate::model::config::{CnnConfig, ModelConfig};
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};
    use rand::SeedableRng;
    use tempfile::TempDir;

    type TestBackend = Autodiff<NdArray>;

    fn samples(dir: &std::path::Path, per_class: usize) -> Vec<ImageSample> {
        let mut out = Vec::new();
        for class in 0..2 {
            for i in 0..per_class {
                let path = dir.join(format!("{class}_{i}.png"));
                let color = if class == 0 { Rgb([200, 30, 30]) } else { Rgb([30, 30, 200]) };
                RgbImage::from_pixel(16, 16, color).save(&path).unwrap();
                out.push(ImageSample {
                    path,
                    label: Label::new(class, 2).unwrap(),
                });
            }
        }
        out
    }

    #[test]
    fn test_phase_runs_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let all = samples(dir.path(), 4);

        let train = LeafDataset::new(all.clone(), [16, 16]);
        let validation = LeafDataset::new(all[..4].to_vec(), [16, 16]);
        let train_batcher =
            AugmentingBatcher::new([16, 16], Preprocessing::rescale(), AugmentationConfig::none(), 1);
        let eval_batcher = LeafBatcher::new([16, 16], Preprocessing::rescale());
        let data = FitData {
            train: &train,
            validation: &validation,
            train_batcher: &train_batcher,
            eval_batcher: &eval_batcher,
            batch_size: 4,
        };

        let model = PlantClassifier::<TestBackend>::init(
            &ModelConfig::cnn(CnnConfig::tiny()),
            2,
            [16, 16],
            &device,
        )
        .unwrap();

        let settings = PhaseSettings {
            phase: TrainingPhase::InitialTrain,
            epochs: 2,
            learning_rate: 1e-3,
            first_epoch: 1,
        };
        let paths = ArtifactPaths::new(dir.path().join("models"));
        let mut checkpoint = BestCheckpoint::new();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let (_, history) = run_phase(
            model,
            &data,
            &settings,
            &TrainingConfig::default(),
            &mut checkpoint,
            &paths,
            &mut rng,
            &device,
        )
        .unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history.epochs[0].epoch, 1);
        assert_eq!(history.epochs[1].epoch, 2);
        assert!(history.epochs.iter().all(|m| m.train_loss.is_finite()));
        assert!(checkpoint.best_epoch.is_some());
        assert!(paths.best_model().exists());
    }

    #[test]
    fn test_early_stop_restores_best_weights() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let all = samples(dir.path(), 4);

        let train = LeafDataset::new(all.clone(), [16, 16]);
        let validation = LeafDataset::new(all, [16, 16]);
        let train_batcher =
            AugmentingBatcher::new([16, 16], Preprocessing::rescale(), AugmentationConfig::none(), 3);
        let eval_batcher = LeafBatcher::new([16, 16], Preprocessing::rescale());
        let data = FitData {
            train: &train,
            validation: &validation,
            train_batcher: &train_batcher,
            eval_batcher: &eval_batcher,
            batch_size: 2,
        };

        let model = PlantClassifier::<TestBackend>::init(
            &ModelConfig::cnn(CnnConfig::tiny()),
            2,
            [16, 16],
            &device,
        )
        .unwrap();

        // Only the first epoch can count as an improvement
        let training = TrainingConfig {
            early_stopping_patience: 1,
            min_delta: 1e9,
            ..TrainingConfig::default()
        };
        let settings = PhaseSettings {
            phase: TrainingPhase::InitialTrain,
            epochs: 20,
            learning_rate: 1e-2,
            first_epoch: 1,
        };
        let paths = ArtifactPaths::new(dir.path().join("models"));
        let mut checkpoint = BestCheckpoint::new();
        let mut rng = ChaCha8Rng::seed_from_u64(5);

        let (model, history) = run_phase(
            model,
            &data,
            &settings,
            &training,
            &mut checkpoint,
            &paths,
            &mut rng,
            &device,
        )
        .unwrap();

        assert_eq!(history.len(), 2);
        assert!(history.len() < settings.epochs);

        let restored = evaluate(&model.valid(), &validation, &eval_batcher, 2, &device).unwrap();
        assert!((restored.loss - history.epochs[0].val_loss).abs() < 1e-5);
        assert!((restored.accuracy - history.epochs[0].val_accuracy).abs() < 1e-9);
    }

    #[test]
    fn test_empty_training_split_is_rejected() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let train = LeafDataset::new(Vec::new(), [16, 16]);
        let validation = LeafDataset::new(samples(dir.path(), 1), [16, 16]);
        let train_batcher =
            AugmentingBatcher::new([16, 16], Preprocessing::rescale(), AugmentationConfig::none(), 1);
        let eval_batcher = LeafBatcher::new([16, 16], Preprocessing::rescale());
        let data = FitData {
            train: &train,
            validation: &validation,
            train_batcher: &train_batcher,
            eval_batcher: &eval_batcher,
            batch_size: 2,
        };
        let model = PlantClassifier::<TestBackend>::init(
            &ModelConfig::cnn(CnnConfig::tiny()),
            2,
            [16, 16],
            &device,
        )
        .unwrap();
        let settings = PhaseSettings {
            phase: TrainingPhase::InitialTrain,
            epochs: 1,
            learning_rate: 1e-3,
            first_epoch: 1,
        };

        let result = run_phase(
            model,
            &data,
            &settings,
            &TrainingConfig::default(),
            &mut BestCheckpoint::new(),
            &ArtifactPaths::new(dir.path().join("models")),
            &mut ChaCha8Rng::seed_from_u64(0),
            &device,
        );
        assert!(matches!(result, Err(PlantDiseaseError::Training(_))));
    }

    #[test]
    fn test_evaluate_counts_every_sample() {
        let dir = TempDir::new().unwrap();
        let device = Default::default();
        let dataset = LeafDataset::new(samples(dir.path(), 3), [16, 16]);
        let batcher = LeafBatcher::new([16, 16], Preprocessing::rescale());
        let model = PlantClassifier::<NdArray>::init(
            &ModelConfig::cnn(CnnConfig::tiny()),
            2,
            [16, 16],
            &device,
        )
        .unwrap();

        let output = evaluate(&model, &dataset, &batcher, 4, &device).unwrap();
        assert_eq!(output.len(), 6);
        assert_eq!(output.targets, vec![0, 0, 0, 1, 1, 1]);
        assert!(output.loss.is_finite());
        assert!((0.0..=1.0).contains(&output.accuracy));

        let names = vec!["red".to_string(), "blue".to_string()];
        let report = output.into_report("validation", &names);
        assert_eq!(report.total_samples, 6);
    }
}
