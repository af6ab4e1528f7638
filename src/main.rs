//! Plant disease classifier CLI
//!
//! `train` runs the full pipeline, `test` classifies images with a saved model
//! and `stats` summarizes a dataset folder.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use plant_disease::backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
use plant_disease::config::PipelineConfig;
use plant_disease::dataset::{DatasetSplits, ImageFolder, SplitConfig};
use plant_disease::inference::{run_test_command, TestOptions};
use plant_disease::model::ModelType;
use plant_disease::training::run_pipeline;
use plant_disease::utils::logging::{init_logging, LogConfig};

/// Plant disease image classification with Burn
#[derive(Parser, Debug)]
#[command(name = "plant_disease")]
#[command(version)]
#[command(about = "Train and run a plant disease image classifier", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a model and write it with its class catalog and metadata
    Train {
        /// Pipeline configuration file (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Dataset root with one subdirectory per class
        #[arg(short, long, value_name = "DIR")]
        data_dir: Option<PathBuf>,

        /// Separate labelled test folder
        #[arg(long, value_name = "DIR")]
        test_dir: Option<PathBuf>,

        /// Where model files are written
        #[arg(short, long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        #[arg(short, long, value_name = "N")]
        epochs: Option<usize>,

        #[arg(short, long, value_name = "SIZE")]
        batch_size: Option<usize>,

        #[arg(short, long, value_name = "LR")]
        learning_rate: Option<f64>,

        /// Architecture: cnn or transfer
        #[arg(short, long, value_name = "TYPE")]
        model: Option<ModelType>,

        /// Seed for the split, shuffling and augmentation
        #[arg(long, value_name = "SEED")]
        seed: Option<u64>,

        /// Run the fine-tune phase after initial training (transfer only)
        #[arg(long)]
        fine_tune: bool,

        /// Validate the configuration and exit
        #[arg(long)]
        dry_run: bool,
    },

    /// Classify an image, or the first few images of the sample folder
    Test {
        /// Image to classify; the sample folder is scanned when omitted
        image: Option<PathBuf>,

        /// Pipeline configuration file (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Directory holding the trained model
        #[arg(short, long, value_name = "DIR")]
        model_dir: Option<PathBuf>,

        /// Folder scanned when no image is given
        #[arg(short, long, value_name = "DIR")]
        sample_dir: Option<PathBuf>,

        /// Where annotated images are written
        #[arg(short, long, value_name = "DIR")]
        output_dir: Option<PathBuf>,

        /// Number of ranked classes to print
        #[arg(short = 'k', long, value_name = "K")]
        top_k: Option<usize>,
    },

    /// Show dataset statistics and split sizes
    Stats {
        /// Pipeline configuration file (TOML)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Dataset root with one subdirectory per class
        #[arg(short, long, value_name = "DIR")]
        data_dir: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.command {
        Commands::Train { config, .. } | Commands::Test { config, .. } | Commands::Stats { config, .. } => {
            config.clone()
        }
    };
    let config = load_config(config_path.as_deref())?;

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        config.logging.clone()
    };
    let _ = init_logging(&log_config);

    print_banner();

    match cli.command {
        Commands::Train {
            data_dir,
            test_dir,
            output_dir,
            epochs,
            batch_size,
            learning_rate,
            model,
            seed,
            fine_tune,
            dry_run,
            ..
        } => {
            let mut config = config;
            if let Some(dir) = data_dir {
                config.data.data_dir = dir;
            }
            if test_dir.is_some() {
                config.data.test_dir = test_dir;
            }
            if let Some(dir) = output_dir {
                config.output.model_dir = dir;
            }
            if let Some(n) = epochs {
                config.training.epochs = n;
            }
            if let Some(size) = batch_size {
                config.data.batch_size = size;
            }
            if let Some(lr) = learning_rate {
                config.training.learning_rate = lr;
            }
            if let Some(model_type) = model {
                config.model.model_type = model_type;
            }
            if let Some(seed) = seed {
                config.data.seed = seed;
            }
            if fine_tune {
                config.fine_tune.enabled = true;
            }
            cmd_train(&config, dry_run)
        }

        Commands::Test {
            image,
            model_dir,
            sample_dir,
            output_dir,
            top_k,
            ..
        } => cmd_test(test_options(&config, image, model_dir, sample_dir, output_dir, top_k)),

        Commands::Stats { data_dir, .. } => {
            let mut config = config;
            if let Some(dir) = data_dir {
                config.data.data_dir = dir;
            }
            cmd_stats(&config)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn print_banner() {
    println!(
        "{}",
        r#"
 +------------------------------------------------------------+
 |   Plant Disease Classifier                                 |
 |   Leaf image classification with Burn + Rust               |
 +------------------------------------------------------------+
  "#
        .green()
    );
}

fn cmd_train(config: &PipelineConfig, dry_run: bool) -> Result<()> {
    config.validate().context("Invalid configuration")?;

    println!("{}", "Training Configuration:".cyan().bold());
    println!("  Data:        {}", config.data.data_dir.display());
    println!("  Output:      {}", config.output.model_dir.display());
    println!("  Model:       {}", config.model.model_type);
    println!("  Image size:  {:?}", config.data.image_size);
    println!("  Epochs:      {}", config.training.epochs);
    println!("  Batch size:  {}", config.data.batch_size);
    println!("  LR:          {:.1e}", config.training.learning_rate);
    println!("  Fine-tune:   {}", config.fine_tune_active());
    println!("  Backend:     {}", backend_name());
    println!();

    if dry_run {
        println!("{}", "Configuration is valid (dry run)".green());
        return Ok(());
    }

    if !config.data.data_dir.is_dir() {
        anyhow::bail!("dataset directory not found: {}", config.data.data_dir.display());
    }

    std::fs::create_dir_all(&config.output.model_dir)
        .with_context(|| format!("Failed to create {}", config.output.model_dir.display()))?;
    let config_path = config.output.model_dir.join("config.toml");
    config.save(&config_path).context("Failed to save configuration")?;
    info!("Configuration saved to: {}", config_path.display());

    let device = default_device();
    let outcome = run_pipeline::<TrainingBackend>(config, &device).context("Training failed")?;

    println!();
    println!("{}", "Artifacts:".cyan().bold());
    println!("  Model:    {}", outcome.model_path.display());
    println!("  Classes:  {}", outcome.paths.class_names().display());
    println!("  Metadata: {}", outcome.paths.metadata().display());
    if let Some(report) = &outcome.test {
        println!("  Test accuracy: {:.2}%", report.accuracy * 100.0);
    }
    Ok(())
}

/// Config values, with flags taking precedence where given
fn test_options(
    config: &PipelineConfig,
    image: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    sample_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    top_k: Option<usize>,
) -> TestOptions {
    let mut inference = config.inference.clone();
    if let Some(dir) = sample_dir {
        inference.sample_dir = dir;
    }
    if let Some(dir) = output_dir {
        inference.predictions_dir = dir;
    }
    if let Some(k) = top_k {
        inference.top_k = k;
    }
    TestOptions {
        image,
        model_dir: model_dir.unwrap_or_else(|| config.output.model_dir.clone()),
        inference,
    }
}

fn cmd_test(options: TestOptions) -> Result<()> {
    println!("{}", "Inference Configuration:".cyan().bold());
    println!("  Model dir: {}", options.model_dir.display());
    match &options.image {
        Some(path) => println!("  Image:     {}", path.display()),
        None => println!("  Samples:   {}", options.inference.sample_dir.display()),
    }
    println!("  Output:    {}", options.inference.predictions_dir.display());
    println!("  Backend:   {}", backend_name());
    println!();

    let device = default_device();
    run_test_command::<DefaultBackend>(&options, &device).context("Test command failed")?;
    Ok(())
}

fn cmd_stats(config: &PipelineConfig) -> Result<()> {
    let folder = ImageFolder::open(&config.data.data_dir)
        .with_context(|| format!("Failed to load dataset from {}", config.data.data_dir.display()))?;
    folder.stats().print();

    let split = SplitConfig {
        validation_fraction: config.data.validation_split,
        test_fraction: config.data.test_split,
        seed: config.data.seed,
        stratified: config.data.stratified,
    };
    let num_classes = folder.num_classes();
    let splits = DatasetSplits::from_samples(folder.samples, num_classes, &split)?;
    let stats = splits.stats();

    println!();
    println!("{}", "Split Configuration:".yellow().bold());
    println!("  Seed:       {}", split.seed);
    println!("  Train:      {}", stats.train_size);
    println!("  Validation: {}", stats.validation_size);
    println!("  Test:       {}", stats.test_size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_keep_configured_predictions_dir() {
        let mut config = PipelineConfig::default();
        config.inference.predictions_dir = PathBuf::from("out/annotated");
        config.inference.top_k = 3;

        let options = test_options(&config, None, Some("trained".into()), None, None, None);
        assert_eq!(options.inference.predictions_dir, PathBuf::from("out/annotated"));
        assert_eq!(options.model_dir, PathBuf::from("trained"));
        assert_eq!(options.inference.top_k, 3);

        let options = test_options(&config, None, None, None, Some("elsewhere".into()), Some(7));
        assert_eq!(options.inference.predictions_dir, PathBuf::from("elsewhere"));
        assert_eq!(options.model_dir, config.output.model_dir);
        assert_eq!(options.inference.top_k, 7);
    }

    #[test]
    fn test_cli_parses_test_flags() {
        let cli = Cli::try_parse_from(["plant_disease", "test", "leaf.jpg", "-k", "2"]).unwrap();
        match cli.command {
            Commands::Test { image, top_k, output_dir, .. } => {
                assert_eq!(image, Some(PathBuf::from("leaf.jpg")));
                assert_eq!(top_k, Some(2));
                assert!(output_dir.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
