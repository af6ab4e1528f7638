//! The `test` command: classify one image, or a handful from a sample folder,
//! and write an annotated copy of each.

use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use colored::Colorize;
use tracing::{error, warn};
use walkdir::WalkDir;

use crate::config::InferenceConfig;
use crate::dataset::preprocess::open_image;
use crate::inference::predictor::{PredictionResult, Predictor};
use crate::inference::visualize::{prediction_output_path, save_prediction, OverlayConfig};
use crate::utils::error::{PlantDiseaseError, Result};
use crate::utils::{format_number, is_supported_image};

/// Inputs for [`run_test_command`]
#[derive(Debug, Clone)]
pub struct TestOptions {
    /// Classify only this image; otherwise scan `inference.sample_dir`
    pub image: Option<PathBuf>,
    pub model_dir: PathBuf,
    pub inference: InferenceConfig,
}

#[derive(Debug, Clone, Default)]
pub struct TestSummary {
    pub processed: usize,
    pub failed: usize,
    pub outputs: Vec<PathBuf>,
    pub confidences: Vec<f32>,
}

impl TestSummary {
    pub fn mean_confidence(&self) -> Option<f32> {
        if self.confidences.is_empty() {
            None
        } else {
            Some(self.confidences.iter().sum::<f32>() / self.confidences.len() as f32)
        }
    }

    pub fn min_confidence(&self) -> Option<f32> {
        self.confidences.iter().copied().reduce(f32::min)
    }

    pub fn max_confidence(&self) -> Option<f32> {
        self.confidences.iter().copied().reduce(f32::max)
    }

    fn print(&self) {
        println!();
        println!("{}", "Summary:".cyan().bold());
        println!("  Images processed: {}", self.processed);
        println!("  Failures:         {}", self.failed);
        if let (Some(mean), Some(min), Some(max)) =
            (self.mean_confidence(), self.min_confidence(), self.max_confidence())
        {
            println!("  Mean confidence:  {:.2}%", mean * 100.0);
            println!("  Min confidence:   {:.2}%", min * 100.0);
            println!("  Max confidence:   {:.2}%", max * 100.0);
        }
    }
}

/// Supported images under `dir`, in sorted path order, at most `limit`
pub fn collect_sample_images(dir: &Path, limit: usize) -> Vec<PathBuf> {
    let mut images: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file() && is_supported_image(entry.path()))
        .map(|entry| entry.into_path())
        .collect();
    images.sort();
    images.truncate(limit);
    images
}

fn print_model_info<B: Backend>(predictor: &Predictor<B>) {
    let metadata = predictor.metadata();
    println!("{}", "Model Information:".cyan().bold());
    println!("  Weights:     {}", predictor.model_path().display());
    println!("  Input shape: {:?}", predictor.input_shape());
    println!("  Output shape: {:?}", predictor.output_shape());
    println!("  Classes:     {}", metadata.num_classes);
    println!("  Model type:  {}", metadata.model_type);
    println!("  Parameters:  {}", format_number(predictor.num_params()));
    let names = predictor.catalog().names();
    let shown: Vec<&str> = names.iter().take(10).map(String::as_str).collect();
    let more = if names.len() > shown.len() { ", ..." } else { "" };
    println!("  Class names: {}{}", shown.join(", "), more);
    println!();
}

fn print_prediction(result: &PredictionResult) {
    println!(
        "  {} {} ({:.2}%)",
        "Prediction:".green().bold(),
        result.class_name.green(),
        result.confidence * 100.0
    );
    for (rank, (idx, name, prob)) in result.top_k.iter().enumerate() {
        println!("    {}. {:40} {:>6.2}%  [class {}]", rank + 1, name, prob * 100.0, idx);
    }
}

fn process_image<B: Backend>(
    predictor: &Predictor<B>,
    path: &Path,
    options: &TestOptions,
    overlay: &OverlayConfig,
) -> Result<(PredictionResult, PathBuf)> {
    let source = open_image(path)?;
    let result = predictor.predict_image(&source, options.inference.top_k, Some(path))?;
    let output = prediction_output_path(&options.inference.predictions_dir, path);
    save_prediction(&source, &result, overlay, &output)?;
    Ok((result, output))
}

/// Load the model in `options.model_dir` and classify the requested images
pub fn run_test_command<B: Backend>(options: &TestOptions, device: &B::Device) -> Result<TestSummary> {
    let predictor = Predictor::<B>::load(&options.model_dir, device)?;
    print_model_info(&predictor);

    let images = match &options.image {
        Some(path) => {
            if !path.is_file() {
                return Err(PlantDiseaseError::NotFound(path.clone()));
            }
            vec![path.clone()]
        }
        None => {
            let dir = &options.inference.sample_dir;
            let images = collect_sample_images(dir, options.inference.max_samples);
            if images.is_empty() {
                println!(
                    "{} No jpg/jpeg/png images found in {}",
                    "Warning:".yellow(),
                    dir.display()
                );
                return Ok(TestSummary::default());
            }
            images
        }
    };

    let overlay = OverlayConfig::from_inference(&options.inference)?;
    let mut summary = TestSummary::default();

    for path in &images {
        println!("{} {}", "Image:".cyan(), path.display());
        match process_image(&predictor, path, options, &overlay) {
            Ok((result, output)) => {
                print_prediction(&result);
                println!("  Saved: {}", output.display());
                summary.processed += 1;
                summary.confidences.push(result.confidence);
                summary.outputs.push(output);
            }
            Err(e) if options.image.is_some() => return Err(e),
            Err(e) => {
                error!("Failed to process {}: {}", path.display(), e);
                summary.failed += 1;
            }
        }
    }

    if summary.processed == 0 {
        warn!("No image could be classified");
    }
    summary.print();
    Ok(summary)
}
