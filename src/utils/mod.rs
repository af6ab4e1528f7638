//! Utilities module for logging, metrics, and helper functions
//!
//! This module provides:
//! - Structured logging with tracing
//! - Evaluation metrics (confusion matrix, per-class precision/recall/F1)
//! - SVG training charts
//! - Error handling types

pub mod charts;
pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{PlantDiseaseError, Result};
pub use logging::{init_logging, LogConfig, LogLevel};
pub use metrics::{ConfusionMatrix, EvaluationReport};

/// Format a number with thousands separator
pub fn format_number(n: usize) -> String {
    let s = n.to_string();
    let mut result = String::new();
    let chars: Vec<char> = s.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        if i > 0 && (chars.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }

    result
}

/// True if the path has a jpg/jpeg/png extension, in any letter case
pub fn is_supported_image(path: &std::path::Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "jpg" | "jpeg" | "png"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1000000), "1,000,000");
        assert_eq!(format_number(42), "42");
    }

    #[test]
    fn test_is_supported_image() {
        assert!(is_supported_image(Path::new("leaf.JPG")));
        assert!(is_supported_image(Path::new("a/b/leaf.jpeg")));
        assert!(is_supported_image(Path::new("leaf.Png")));
        assert!(!is_supported_image(Path::new("leaf.bmp")));
        assert!(!is_supported_image(Path::new("README")));
    }
}
