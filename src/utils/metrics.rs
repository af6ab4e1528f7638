//! Evaluation metrics for the classifier
//!
//! - Confusion matrix (rows = actual, cols = predicted)
//! - Per-class precision, recall and F1
//! - Running averages for the fit loop

use serde::{Deserialize, Serialize};

/// Summary of a model evaluated on one split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Which split was evaluated ("validation" or "test")
    pub split: String,
    pub total_samples: usize,
    pub correct_predictions: usize,
    pub accuracy: f64,
    /// Mean cross-entropy over the split
    pub loss: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub per_class: Vec<ClassMetrics>,
    pub confusion_matrix: ConfusionMatrix,
}

impl EvaluationReport {
    /// Build a report from predicted and actual class indices.
    ///
    /// `predictions` and `ground_truth` are paired by position; extra entries
    /// in the longer slice are ignored.
    pub fn from_predictions(
        split: &str,
        predictions: &[usize],
        ground_truth: &[usize],
        class_names: &[String],
        loss: f64,
    ) -> Self {
        let num_classes = class_names.len();
        let confusion_matrix =
            ConfusionMatrix::from_predictions(predictions, ground_truth, num_classes);

        let per_class: Vec<ClassMetrics> = class_names
            .iter()
            .enumerate()
            .map(|(idx, name)| ClassMetrics::from_confusion_matrix(&confusion_matrix, idx).with_name(name))
            .collect();

        // Classes absent from the split do not drag the macro averages down
        let present: Vec<&ClassMetrics> = per_class.iter().filter(|m| m.support > 0).collect();
        let macro_avg = |f: fn(&ClassMetrics) -> f64| {
            if present.is_empty() {
                0.0
            } else {
                present.iter().map(|m| f(m)).sum::<f64>() / present.len() as f64
            }
        };

        Self {
            split: split.to_string(),
            total_samples: confusion_matrix.total(),
            correct_predictions: confusion_matrix.correct(),
            accuracy: confusion_matrix.accuracy(),
            loss,
            macro_precision: macro_avg(|m| m.precision),
            macro_recall: macro_avg(|m| m.recall),
            macro_f1: macro_avg(|m| m.f1),
            per_class,
            confusion_matrix,
        }
    }

    /// Multi-line summary for the console
    pub fn display(&self) -> String {
        let mut output = String::new();
        output.push_str(&format!("Evaluation on {} split\n", self.split));
        output.push_str(&format!("  Samples:         {}\n", self.total_samples));
        output.push_str(&format!("  Loss:            {:.4}\n", self.loss));
        output.push_str(&format!("  Accuracy:        {:.2}%\n", self.accuracy * 100.0));
        output.push_str(&format!("  Macro precision: {:.2}%\n", self.macro_precision * 100.0));
        output.push_str(&format!("  Macro recall:    {:.2}%\n", self.macro_recall * 100.0));
        output.push_str(&format!("  Macro F1:        {:.2}%\n", self.macro_f1 * 100.0));
        output.push_str("\n  Per class:\n");
        for m in &self.per_class {
            output.push_str(&format!(
                "    {:3}. {:40} P={:.2} R={:.2} F1={:.2} (n={})\n",
                m.class_idx,
                m.class_name.as_deref().unwrap_or("?"),
                m.precision,
                m.recall,
                m.f1,
                m.support
            ));
        }
        output
    }
}

impl std::fmt::Display for EvaluationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Per-class metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_idx: usize,
    pub class_name: Option<String>,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    /// Precision = TP / (TP + FP)
    pub precision: f64,
    /// Recall = TP / (TP + FN)
    pub recall: f64,
    pub f1: f64,
    /// Number of actual samples of this class
    pub support: usize,
}

impl ClassMetrics {
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let true_positives = cm.get(class_idx, class_idx);
        let false_positives = cm.col_sums().get(class_idx).copied().unwrap_or(0) - true_positives;
        let false_negatives = cm.row_sums().get(class_idx).copied().unwrap_or(0) - true_positives;

        let ratio = |num: usize, den: usize| if den > 0 { num as f64 / den as f64 } else { 0.0 };
        let precision = ratio(true_positives, true_positives + false_positives);
        let recall = ratio(true_positives, true_positives + false_negatives);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_idx,
            class_name: None,
            true_positives,
            false_positives,
            false_negatives,
            precision,
            recall,
            f1,
            support: true_positives + false_negatives,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.class_name = Some(name.to_string());
        self
    }
}

/// Confusion Matrix for multi-class classification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub num_classes: usize,
    /// Row-major counts, row = actual, column = predicted
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    pub fn from_predictions(
        predictions: &[usize],
        ground_truth: &[usize],
        num_classes: usize,
    ) -> Self {
        let mut cm = Self::new(num_classes);
        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }
        cm
    }

    /// Record one prediction; out-of-range indices are ignored
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted] += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total > 0 {
            self.correct() as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Actual class counts
    pub fn row_sums(&self) -> Vec<usize> {
        (0..self.num_classes)
            .map(|row| (0..self.num_classes).map(|col| self.get(row, col)).sum())
            .collect()
    }

    /// Predicted class counts
    pub fn col_sums(&self) -> Vec<usize> {
        (0..self.num_classes)
            .map(|col| (0..self.num_classes).map(|row| self.get(row, col)).sum())
            .collect()
    }

    /// Render the matrix; large matrices collapse to a one-line summary
    pub fn display(&self, class_names: Option<&[String]>) -> String {
        let mut output = String::from("\nConfusion Matrix (rows=actual, cols=predicted):\n\n");

        let max_display = 20;
        if self.num_classes > max_display {
            output.push_str(&format!(
                "(Matrix too large to display: {}x{}, accuracy {:.2}%)\n",
                self.num_classes,
                self.num_classes,
                self.accuracy() * 100.0
            ));
            return output;
        }

        let short = |idx: usize, width: usize| -> String {
            match class_names.and_then(|names| names.get(idx)) {
                Some(name) => name.chars().take(width).collect(),
                None => idx.to_string(),
            }
        };

        output.push_str("          ");
        for col in 0..self.num_classes {
            output.push_str(&format!("{:>6}", short(col, 6)));
        }
        output.push('\n');

        for row in 0..self.num_classes {
            output.push_str(&format!("{:>8} ", short(row, 8)));
            for col in 0..self.num_classes {
                let count = self.get(row, col);
                if row == col {
                    output.push_str(&format!("[{:>4}]", count));
                } else if count > 0 {
                    output.push_str(&format!(" {:>4} ", count));
                } else {
                    output.push_str("    . ");
                }
            }
            output.push('\n');
        }

        output
    }
}

impl std::fmt::Display for ConfusionMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display(None))
    }
}

/// Sample-weighted running average
#[derive(Debug, Clone, Default)]
pub struct RunningAverage {
    sum: f64,
    count: usize,
}

impl RunningAverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a batch mean weighted by its sample count
    pub fn add_weighted(&mut self, value: f64, weight: usize) {
        self.sum += value * weight as f64;
        self.count += weight;
    }

    pub fn average(&self) -> f64 {
        if self.count > 0 {
            self.sum / self.count as f64
        } else {
            0.0
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class_{i}")).collect()
    }

    #[test]
    fn test_confusion_matrix() {
        let predictions = vec![0, 1, 2, 0, 1, 2, 0, 0, 2, 2];
        let ground_truth = vec![0, 1, 2, 0, 2, 2, 1, 0, 1, 2];

        let cm = ConfusionMatrix::from_predictions(&predictions, &ground_truth, 3);

        assert_eq!(cm.get(0, 0), 3);
        assert_eq!(cm.get(1, 1), 1);
        assert_eq!(cm.get(2, 2), 3);
        assert_eq!(cm.total(), 10);
        assert_eq!(cm.correct(), 7);
        assert!((cm.accuracy() - 0.7).abs() < 1e-9);
        assert_eq!(cm.row_sums(), vec![3, 3, 4]);
    }

    #[test]
    fn test_class_metrics() {
        let predictions = vec![0, 0, 0, 1, 1];
        let ground_truth = vec![0, 0, 1, 1, 0];

        let cm = ConfusionMatrix::from_predictions(&predictions, &ground_truth, 2);
        let class0 = ClassMetrics::from_confusion_matrix(&cm, 0);

        assert_eq!(class0.true_positives, 2);
        assert_eq!(class0.false_positives, 1);
        assert_eq!(class0.false_negatives, 1);
        assert!((class0.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((class0.recall - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(class0.support, 3);
    }

    #[test]
    fn test_report_ignores_absent_classes_in_macro_average() {
        let report = EvaluationReport::from_predictions("validation", &[0, 0], &[0, 0], &names(3), 0.1);
        assert_eq!(report.total_samples, 2);
        assert!((report.accuracy - 1.0).abs() < 1e-9);
        assert!((report.macro_f1 - 1.0).abs() < 1e-9);
        assert!(report.display().contains("class_0"));
    }

    #[test]
    fn test_display_uses_class_names() {
        let cm = ConfusionMatrix::from_predictions(&[0, 1], &[0, 1], 2);
        let text = cm.display(Some(&["healthy".to_string(), "blight".to_string()]));
        assert!(text.contains("healthy"));
        assert!(text.contains("[   1]"));
    }

    #[test]
    fn test_running_average_is_sample_weighted() {
        let mut avg = RunningAverage::new();
        avg.add_weighted(1.0, 3);
        avg.add_weighted(3.0, 1);
        assert_eq!(avg.count(), 4);
        assert!((avg.average() - 1.5).abs() < 1e-9);
    }
}
