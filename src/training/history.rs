//! Per-epoch training history, continuous across phases

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::utils::charts::{generate_line_chart, DataSeries, YAxis, COLOR_PRIMARY, COLOR_SECONDARY, COLOR_TERTIARY, COLOR_QUATERNARY};
use crate::utils::error::Result;

/// Which part of the run an epoch belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingPhase {
    InitialTrain,
    FineTune,
}

impl fmt::Display for TrainingPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InitialTrain => write!(f, "initial_train"),
            Self::FineTune => write!(f, "fine_tune"),
        }
    }
}

/// Metrics for one epoch. Accuracies are fractions in [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    /// 1-based, continuing across phases
    pub epoch: usize,
    pub phase: TrainingPhase,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    /// Append another phase's records
    pub fn extend(&mut self, other: TrainingHistory) {
        self.epochs.extend(other.epochs);
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Epoch number the next record should carry
    pub fn next_epoch(&self) -> usize {
        self.epochs.last().map(|m| m.epoch + 1).unwrap_or(1)
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    pub fn best_val_accuracy(&self) -> Option<f64> {
        self.epochs
            .iter()
            .map(|m| m.val_accuracy)
            .fold(None, |best, acc| Some(best.map_or(acc, |b: f64| b.max(acc))))
    }

    /// Epoch where fine-tuning began, if it ran
    pub fn fine_tune_start(&self) -> Option<usize> {
        self.epochs
            .iter()
            .find(|m| m.phase == TrainingPhase::FineTune)
            .map(|m| m.epoch)
    }

    pub fn to_csv(&self) -> String {
        let mut csv = String::from("epoch,phase,train_loss,train_acc,val_loss,val_acc,learning_rate\n");
        for m in &self.epochs {
            csv.push_str(&format!(
                "{},{},{:.6},{:.6},{:.6},{:.6},{:.3e}\n",
                m.epoch, m.phase, m.train_loss, m.train_accuracy, m.val_loss, m.val_accuracy, m.learning_rate
            ));
        }
        csv
    }

    pub fn save_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.to_csv())?;
        info!("Metrics saved to: {}", path.display());
        Ok(())
    }

    /// Write `<stem>_accuracy.svg` and `<stem>_loss.svg` next to each other
    pub fn save_charts(&self, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)?;

        let points = |f: fn(&EpochMetrics) -> f64| -> Vec<(f64, f64)> {
            self.epochs.iter().map(|m| (m.epoch as f64, f(m))).collect()
        };
        let markers: Vec<(f64, &str)> = self
            .fine_tune_start()
            .map(|e| vec![(e as f64 - 0.5, "fine-tune")])
            .unwrap_or_default();

        let accuracy = [
            DataSeries::new("train", COLOR_PRIMARY, points(|m| m.train_accuracy * 100.0)),
            DataSeries::new("validation", COLOR_SECONDARY, points(|m| m.val_accuracy * 100.0)),
        ];
        generate_line_chart(
            "Accuracy",
            "Epoch",
            "Accuracy (%)",
            &accuracy,
            YAxis::Percent,
            &markers,
            &dir.join(format!("{stem}_accuracy.svg")),
        )?;

        let loss = [
            DataSeries::new("train", COLOR_TERTIARY, points(|m| m.train_loss)),
            DataSeries::new("validation", COLOR_QUATERNARY, points(|m| m.val_loss)),
        ];
        generate_line_chart(
            "Loss",
            "Epoch",
            "Loss",
            &loss,
            YAxis::Auto,
            &markers,
            &dir.join(format!("{stem}_loss.svg")),
        )?;

        info!("Training charts saved to: {}", dir.display());
        Ok(())
    }
}
