//! Inference module for prediction and visualization
//!
//! This module provides:
//! - Model reloading from a model directory with weight-file fallback
//! - Single image prediction with top-k ranking
//! - Annotated prediction images
//! - The `test` command over one image or a sample folder

pub mod predictor;
pub mod runner;
pub mod visualize;

// Re-export main types for convenience
pub use predictor::{top_k, PredictionResult, Predictor};
pub use runner::{collect_sample_images, run_test_command, TestOptions, TestSummary};
pub use visualize::{render_prediction, save_prediction, OverlayConfig};
